//! Truncated ResNet-18 Backbone
//!
//! Only the stem and the first residual stage are kept:
//! conv1 (7x7, stride 2) -> bn1 -> relu -> maxpool (3x3, stride 2) -> layer1
//!
//! The output has 64 channels at 1/4 of the input resolution. Parameter names
//! follow torchvision/timm (`conv1.*`, `bn1.*`, `layer1.{i}.conv{1,2}.*`), so
//! ImageNet weights can be copied in directly.

use candle_core::{ModuleT, Result, Tensor, D};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Module, VarBuilder};

/// Number of channels produced by the truncated backbone
pub const BACKBONE_CHANNELS: usize = 64;

const BN_EPS: f64 = 1e-5;

fn conv_bn(
    vb: &VarBuilder,
    name: &str,
    bn_name: &str,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
) -> Result<(Conv2d, BatchNorm)> {
    let config = Conv2dConfig {
        stride,
        padding: kernel_size / 2,
        ..Default::default()
    };
    let conv = candle_nn::conv2d_no_bias(
        in_channels,
        out_channels,
        kernel_size,
        config,
        vb.pp(name),
    )?;
    let bn_config = BatchNormConfig {
        eps: BN_EPS,
        ..Default::default()
    };
    let bn = batch_norm(out_channels, bn_config, vb.pp(bn_name))?;
    Ok((conv, bn))
}

/// ResNet basic block with identity shortcut (layer1 never changes shape)
#[derive(Debug)]
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
}

impl BasicBlock {
    fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        let (conv1, bn1) = conv_bn(&vb, "conv1", "bn1", channels, channels, 3, 1)?;
        let (conv2, bn2) = conv_bn(&vb, "conv2", "bn2", channels, channels, 3, 1)?;
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
        })
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.conv1.forward(xs)?;
        let ys = self.bn1.forward_t(&ys, train)?.relu()?;
        let ys = self.conv2.forward(&ys)?;
        let ys = self.bn2.forward_t(&ys, train)?;
        (ys + xs)?.relu()
    }
}

/// Visual feature extractor mapping [B, 3, H, W] to [B, 64, H/4, W/4]
#[derive(Debug)]
pub struct Backbone {
    conv1: Conv2d,
    bn1: BatchNorm,
    layer1: Vec<BasicBlock>,
}

impl Backbone {
    pub fn load(vb: VarBuilder) -> Result<Self> {
        let (conv1, bn1) = conv_bn(&vb, "conv1", "bn1", 3, BACKBONE_CHANNELS, 7, 2)?;
        let layer1 = (0..2)
            .map(|i| BasicBlock::load(vb.pp(format!("layer1.{i}")), BACKBONE_CHANNELS))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { conv1, bn1, layer1 })
    }

    pub fn out_channels(&self) -> usize {
        BACKBONE_CHANNELS
    }
}

impl ModuleT for Backbone {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv1.forward(&xs.contiguous()?)?;
        let xs = self.bn1.forward_t(&xs, train)?.relu()?;

        // 3x3/2 max pool with padding 1. Inputs are post-ReLU, so replicating
        // the border gives the same maxima as padding with -inf.
        let mut xs = xs
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        for block in &self.layer1 {
            xs = block.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_output_shape_and_stride() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let backbone = Backbone::load(vb).unwrap();

        let images = Tensor::rand(0.0f32, 1.0, (2, 3, 64, 48), &device).unwrap();
        let features = backbone.forward_t(&images, false).unwrap();
        assert_eq!(features.dims(), &[2, BACKBONE_CHANNELS, 16, 12]);
    }

    #[test]
    fn test_parameter_names_match_torchvision() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _ = Backbone::load(vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in [
            "conv1.weight",
            "bn1.running_mean",
            "layer1.0.conv1.weight",
            "layer1.1.bn2.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }
}
