//! Box geometry features
//!
//! Each box `[owner, x1, y1, x2, y2]` is described by
//! `[x, y, width, height, width / height]` and embedded with
//! Linear -> BatchNorm1d -> ReLU.

use candle_core::{bail, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Linear, Module, VarBuilder};

/// Number of raw geometry features per box
pub const GEOMETRY_DIM: usize = 5;

/// Compute `[x, y, w, h, w / h]` for owner-tagged boxes of shape [N, 5].
///
/// A zero-height box yields a non-finite aspect ratio; this is reported as an
/// error instead of being passed on to the network.
pub fn box_geometry(boxes: &Tensor) -> Result<Tensor> {
    let (n, cols) = boxes.dims2()?;
    if cols != 5 {
        bail!("expected boxes of shape [N, 5], got [{n}, {cols}]");
    }
    let top_left = boxes.narrow(1, 1, 2)?;
    let bottom_right = boxes.narrow(1, 3, 2)?;
    let size = (bottom_right - &top_left)?;
    let width = size.narrow(1, 0, 1)?;
    let height = size.narrow(1, 1, 1)?;
    let aspect_ratio = (width / height)?;

    let ratios: Vec<f32> = aspect_ratio.flatten_all()?.to_vec1()?;
    if let Some(i) = ratios.iter().position(|r| !r.is_finite()) {
        bail!("box {i} has a non-finite aspect ratio, its width or height is degenerate");
    }

    Tensor::cat(&[&top_left, &size, &aspect_ratio], 1)
}

#[derive(Debug)]
pub struct BoxFeatureEncoder {
    linear: Linear,
    bn: BatchNorm,
}

impl BoxFeatureEncoder {
    /// Weight path: `bbox_feat_encoder.0` (linear), `bbox_feat_encoder.1` (norm)
    pub fn load(vb: VarBuilder, out_dim: usize) -> Result<Self> {
        let linear = linear(GEOMETRY_DIM, out_dim, vb.pp("0"))?;
        let bn = batch_norm(out_dim, 1e-5, vb.pp("1"))?;
        Ok(Self { linear, bn })
    }
}

impl ModuleT for BoxFeatureEncoder {
    /// Maps owner-tagged boxes [N, 5] to embeddings [N, out_dim]
    fn forward_t(&self, boxes: &Tensor, train: bool) -> Result<Tensor> {
        let geometry = box_geometry(boxes)?;
        let xs = self.linear.forward(&geometry)?;
        self.bn.forward_t(&xs, train)?.relu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_box_geometry() {
        let boxes = Tensor::from_vec(
            vec![0.0f32, 10.0, 20.0, 50.0, 40.0, 1.0, 0.0, 0.0, 4.0, 8.0],
            (2, 5),
            &Device::Cpu,
        )
        .unwrap();
        let geometry: Vec<Vec<f32>> = box_geometry(&boxes).unwrap().to_vec2().unwrap();
        assert_eq!(geometry[0], vec![10.0, 20.0, 40.0, 20.0, 2.0]);
        assert_eq!(geometry[1], vec![0.0, 0.0, 4.0, 8.0, 0.5]);
    }

    #[test]
    fn test_zero_height_is_an_error() {
        let boxes =
            Tensor::from_vec(vec![0.0f32, 0.0, 5.0, 10.0, 5.0], (1, 5), &Device::Cpu).unwrap();
        let err = box_geometry(&boxes).unwrap_err();
        assert!(err.to_string().contains("non-finite aspect ratio"));
    }

    #[test]
    fn test_encoder_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = BoxFeatureEncoder::load(vb, 32).unwrap();

        let boxes = Tensor::from_vec(
            vec![0.0f32, 0.0, 0.0, 10.0, 10.0, 0.0, 5.0, 5.0, 15.0, 25.0],
            (2, 5),
            &device,
        )
        .unwrap();
        let out = encoder.forward_t(&boxes, false).unwrap();
        assert_eq!(out.dims(), &[2, 32]);

        let min = out.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= 0.0);
    }
}
