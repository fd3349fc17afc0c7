//! VAMWOD Model Implementation
//!
//! Visual attention-based webpage object detection over given candidate boxes:
//!
//! ```text
//! images [B, 3, S, S] --convnet--> feature maps --roi pool--> visual [N, 64*gh*gw]
//! boxes  [N, 5]       --bbox_feat_encoder-------------------> geometry [N, bbox_dim]
//! additional [N, A]   --bn_additional_feat------------------> extra [N, A]
//!
//! own = [visual | geometry | extra]                          [N, n_feat]
//! context = gat(own, context table)                          [N, 0 | d | n_feat]
//! logits = decoder([own | context])                          [N, n_classes]
//! ```

pub mod backbone;
pub mod bbox_encoder;
pub mod classifier;
pub mod context;
pub mod roi_pool;

use std::path::Path;

use candle_core::{bail, DType, Device, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, VarBuilder, VarMap};
use tracing::{debug, warn};
use webtools::ContextTable;

use crate::config::{ContextMode, VamwodConfig};
use backbone::Backbone;
use bbox_encoder::BoxFeatureEncoder;
use classifier::ClassifierHead;
use context::{ContextEncoder, ContextGather};
use roi_pool::RoiPool;

/// Prefix of the backbone parameters in a VAMWOD checkpoint
pub const BACKBONE_PREFIX: &str = "convnet.";

#[derive(Debug)]
pub struct Vamwod {
    config: VamwodConfig,
    convnet: Backbone,
    roi_pool: RoiPool,
    bbox_feat_encoder: Option<BoxFeatureEncoder>,
    bn_additional_feat: Option<BatchNorm>,
    context: ContextEncoder,
    decoder: ClassifierHead,
    n_feat: usize,
}

impl Vamwod {
    /// Build the model from a VarBuilder.
    ///
    /// The spatial scale of the region pooling is measured by running a zero
    /// image of the configured size through the backbone once.
    pub fn load(vb: VarBuilder, config: &VamwodConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        // Weight path: convnet.*
        let convnet = Backbone::load(vb.pp("convnet"))?;
        let dummy = Tensor::zeros((1, 3, config.img_size, config.img_size), DType::F32, vb.device())?;
        let (_, _, feat_h, _) = convnet.forward_t(&dummy, false)?.dims4()?;
        let spatial_scale = feat_h as f32 / config.img_size as f32;
        let roi_pool = RoiPool::new(config.roi_output_size, spatial_scale);
        debug!("backbone feature map {feat_h}x{feat_h}, spatial scale {spatial_scale}");

        // Weight path: bbox_feat_encoder.*
        let bbox_feat_encoder = if config.use_bbox_feat {
            Some(BoxFeatureEncoder::load(vb.pp("bbox_feat_encoder"), config.bbox_hidden_dim)?)
        } else {
            None
        };

        // Weight path: bn_additional_feat.*
        let bn_additional_feat = if config.n_additional_feat > 0 {
            Some(batch_norm(config.n_additional_feat, 1e-5, vb.pp("bn_additional_feat"))?)
        } else {
            None
        };

        let n_visual_feat = roi_pool.output_len(convnet.out_channels());
        let n_feat = n_visual_feat + config.n_bbox_feat() + config.n_additional_feat;

        // Weight path: gat.*
        let context = ContextEncoder::load(vb.clone(), config, n_feat)?;

        // Weight path: decoder.*
        let decoder_in = n_feat + context.output_dim(n_feat);
        let decoder = ClassifierHead::load(vb.pp("decoder"), decoder_in, config.n_classes, config.drop_prob)?;

        Ok(Self {
            config: config.clone(),
            convnet,
            roi_pool,
            bbox_feat_encoder,
            bn_additional_feat,
            context,
            decoder,
            n_feat,
        })
    }

    pub fn config(&self) -> &VamwodConfig {
        &self.config
    }

    pub fn spatial_scale(&self) -> f32 {
        self.roi_pool.spatial_scale()
    }

    /// Width of the own-feature vector of one box
    pub fn n_feat(&self) -> usize {
        self.n_feat
    }

    /// Declared input width of the classifier
    pub fn decoder_in_features(&self) -> usize {
        self.decoder.in_features()
    }

    /// Parse the owner column of a [N, 5] box tensor, checking every value is an
    /// image index in [0, n_images).
    fn owners(rows: &[[f32; 5]], n_images: usize) -> Result<Vec<usize>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let owner = row[0];
                if owner < 0.0 || owner.fract() != 0.0 || owner as usize >= n_images {
                    bail!("box {i} has owner index {owner}, expected an integer in [0, {n_images})");
                }
                Ok(owner as usize)
            })
            .collect()
    }

    /// Concatenated visual, geometry and additional features, [N, n_feat]
    pub fn own_features(
        &self,
        images: &Tensor,
        boxes: &Tensor,
        rows: &[[f32; 5]],
        additional: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let features = self.convnet.forward_t(images, train)?;
        let mut parts = vec![self.roi_pool.forward(&features, rows)?];

        if let Some(encoder) = &self.bbox_feat_encoder {
            parts.push(encoder.forward_t(boxes, train)?);
        }

        match (&self.bn_additional_feat, additional) {
            (Some(bn), Some(extra)) => parts.push(bn.forward_t(extra, train)?),
            (None, None) => {}
            (Some(_), None) => bail!(
                "model expects {} additional features per box, none given",
                self.config.n_additional_feat
            ),
            (None, Some(extra)) => bail!(
                "model takes no additional features, got a tensor of shape {:?}",
                extra.dims()
            ),
        }

        Tensor::cat(&parts, 1)
    }

    /// Class logits for every box of a batch.
    ///
    /// # Arguments
    /// * `images` - Image batch [B, 3, S, S]
    /// * `boxes` - Rows of `[owner, x1, y1, x2, y2]` in input pixels, [N, 5]
    /// * `additional` - Optional per-box external features [N, n_additional_feat]
    /// * `context` - Neighbour table with N rows
    /// * `train` - Enables dropout and batch statistics
    ///
    /// # Returns
    /// Logits of shape [N, n_classes]
    pub fn forward_t(
        &self,
        images: &Tensor,
        boxes: &Tensor,
        additional: Option<&Tensor>,
        context: &ContextTable,
        train: bool,
    ) -> Result<Tensor> {
        let (n_images, _, _, _) = images.dims4()?;
        let (n_boxes, cols) = boxes.dims2()?;
        if cols != 5 {
            bail!("expected boxes of shape [N, 5], got [{n_boxes}, {cols}]");
        }
        if n_boxes == 0 {
            bail!("batch contains no boxes");
        }
        if context.n_boxes() != n_boxes {
            bail!("context table has {} rows for {n_boxes} boxes", context.n_boxes());
        }
        if let Some(extra) = additional {
            let (rows, width) = extra.dims2()?;
            if rows != n_boxes || width != self.config.n_additional_feat {
                bail!(
                    "additional features have shape [{rows}, {width}], expected [{n_boxes}, {}]",
                    self.config.n_additional_feat
                );
            }
        }

        let rows: Vec<[f32; 5]> = boxes
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?
            .into_iter()
            .map(|row| [row[0], row[1], row[2], row[3], row[4]])
            .collect();
        let owners = Self::owners(&rows, n_images)?;
        context.validate(&owners).map_err(candle_core::Error::wrap)?;

        let own = self.own_features(images, boxes, &rows, additional, train)?;

        let features = match self.config.context_mode() {
            ContextMode::Disabled => own,
            ContextMode::Attention | ContextMode::Mean => {
                if context.n_context() != self.config.n_context {
                    bail!(
                        "context table has {} slots per box, model expects {}",
                        context.n_context(),
                        self.config.n_context
                    );
                }
                let gather = ContextGather::new(context, own.device())?;
                match self.context.forward(&own, &gather)? {
                    Some(ctx) => Tensor::cat(&[&own, &ctx], 1)?,
                    None => own,
                }
            }
        };

        self.decoder.forward_t(&features, train)
    }
}

/// Copy ImageNet-pretrained backbone weights into a model's `VarMap`.
///
/// `path` is a safetensors file with torchvision/timm ResNet-18 names
/// (`conv1.weight`, `layer1.0.bn1.running_mean`, ...). Returns the number of
/// tensors copied.
pub fn load_pretrained_backbone(varmap: &mut VarMap, path: &Path, device: &Device) -> Result<usize> {
    let weights = candle_core::safetensors::load(path, device)?;
    let targets: Vec<String> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".to_string()))?;
        data.keys()
            .filter(|name| name.starts_with(BACKBONE_PREFIX))
            .cloned()
            .collect()
    };

    let mut copied = 0;
    for target in targets {
        let source = &target[BACKBONE_PREFIX.len()..];
        match weights.get(source) {
            Some(tensor) => {
                varmap.set_one(&target, tensor.to_dtype(DType::F32)?)?;
                copied += 1;
            }
            None => warn!("{path:?} has no {source}, keeping initial values"),
        }
    }
    if copied == 0 {
        bail!("{path:?} contains no ResNet backbone weights");
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn tiny_config() -> VamwodConfig {
        VamwodConfig {
            img_size: 32,
            roi_output_size: (2, 2),
            bbox_hidden_dim: 4,
            hidden_dim: 8,
            n_context: 2,
            ..Default::default()
        }
    }

    fn build(config: &VamwodConfig) -> (VarMap, Vamwod) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Vamwod::load(vb, config).unwrap();
        (varmap, model)
    }

    /// Two images; boxes 0 and 1 belong to image 0, box 2 to image 1.
    fn inputs() -> (Tensor, Tensor) {
        let images = Tensor::rand(0.0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let boxes = Tensor::from_vec(
            vec![
                0.0f32, 0.0, 0.0, 10.0, 10.0, //
                0.0, 5.0, 5.0, 15.0, 15.0, //
                1.0, 1.0, 1.0, 4.0, 4.0,
            ],
            (3, 5),
            &Device::Cpu,
        )
        .unwrap();
        (images, boxes)
    }

    fn context() -> ContextTable {
        ContextTable::from_rows(&[vec![1, -1], vec![0, -1], vec![-1, -1]]).unwrap()
    }

    #[test]
    fn test_spatial_scale_is_measured() {
        let (_, model) = build(&tiny_config());
        assert_eq!(model.spatial_scale(), 0.25);
        assert_eq!(model.n_feat(), 64 * 4 + 4);
    }

    #[test]
    fn test_decoder_width_without_context() {
        let config = VamwodConfig {
            use_context: false,
            ..tiny_config()
        };
        let (_, model) = build(&config);
        assert_eq!(model.decoder_in_features(), model.n_feat());
    }

    #[test]
    fn test_decoder_width_with_attention_and_mean() {
        let (_, model) = build(&tiny_config());
        assert_eq!(model.decoder_in_features(), model.n_feat() + 8);

        let config = VamwodConfig {
            use_attention: false,
            ..tiny_config()
        };
        let (_, model) = build(&config);
        assert_eq!(model.decoder_in_features(), 2 * model.n_feat());
    }

    #[test]
    fn test_forward_shape_every_mode() {
        let (images, boxes) = inputs();
        for (use_context, use_attention) in [(true, true), (true, false), (false, true)] {
            let config = VamwodConfig {
                use_context,
                use_attention,
                ..tiny_config()
            };
            let (_, model) = build(&config);
            let logits = model.forward_t(&images, &boxes, None, &context(), false).unwrap();
            assert_eq!(logits.dims(), &[3, 4]);
            let train_logits = model.forward_t(&images, &boxes, None, &context(), true).unwrap();
            assert_eq!(train_logits.dims(), &[3, 4]);
        }
    }

    #[test]
    fn test_rejects_cross_image_context() {
        let (_, model) = build(&tiny_config());
        let (images, boxes) = inputs();
        let leaking = ContextTable::from_rows(&[vec![1, 2], vec![0, -1], vec![-1, -1]]).unwrap();
        assert!(model.forward_t(&images, &boxes, None, &leaking, false).is_err());
    }

    #[test]
    fn test_rejects_owner_out_of_range() {
        let (_, model) = build(&tiny_config());
        let (images, _) = inputs();
        let boxes = Tensor::from_vec(
            vec![0.0f32, 0.0, 0.0, 10.0, 10.0, 2.0, 1.0, 1.0, 4.0, 4.0],
            (2, 5),
            &Device::Cpu,
        )
        .unwrap();
        let table = ContextTable::from_rows(&[vec![-1, -1], vec![-1, -1]]).unwrap();
        let err = model.forward_t(&images, &boxes, None, &table, false).unwrap_err();
        assert!(err.to_string().contains("owner index"));
    }

    #[test]
    fn test_rejects_mismatched_counts() {
        let (_, model) = build(&tiny_config());
        let (images, boxes) = inputs();
        let short = ContextTable::from_rows(&[vec![1, -1], vec![0, -1]]).unwrap();
        assert!(model.forward_t(&images, &boxes, None, &short, false).is_err());

        let wide = ContextTable::from_rows(&[vec![1, -1, -1], vec![0, -1, -1], vec![-1, -1, -1]])
            .unwrap();
        assert!(model.forward_t(&images, &boxes, None, &wide, false).is_err());
    }

    #[test]
    fn test_additional_features() {
        let config = VamwodConfig {
            n_additional_feat: 3,
            ..tiny_config()
        };
        let (_, model) = build(&config);
        assert_eq!(model.n_feat(), 64 * 4 + 4 + 3);

        let (images, boxes) = inputs();
        let extra = Tensor::rand(0.0f32, 1.0, (3, 3), &Device::Cpu).unwrap();
        let logits = model
            .forward_t(&images, &boxes, Some(&extra), &context(), false)
            .unwrap();
        assert_eq!(logits.dims(), &[3, 4]);

        assert!(model.forward_t(&images, &boxes, None, &context(), false).is_err());
        let wrong = Tensor::rand(0.0f32, 1.0, (3, 2), &Device::Cpu).unwrap();
        assert!(model
            .forward_t(&images, &boxes, Some(&wrong), &context(), false)
            .is_err());
    }

    #[test]
    fn test_parameter_names() {
        let (varmap, _) = build(&tiny_config());
        let data = varmap.data().lock().unwrap();
        for name in [
            "convnet.conv1.weight",
            "convnet.layer1.1.conv2.weight",
            "bbox_feat_encoder.0.weight",
            "bbox_feat_encoder.1.running_mean",
            "gat.W_i.weight",
            "gat.W_j.weight",
            "gat.attention_layer.bias",
            "decoder.1.weight",
            "decoder.2.weight",
            "decoder.5.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!data.contains_key("gat.W_i.bias"));
    }

    #[test]
    fn test_load_pretrained_backbone() {
        let (mut varmap, _) = build(&tiny_config());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resnet18.safetensors");

        let conv1 = Tensor::ones((64, 3, 7, 7), DType::F32, &Device::Cpu).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("conv1.weight".to_string(), conv1);
        tensors.insert(
            "fc.weight".to_string(),
            Tensor::zeros((10, 512), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let copied = load_pretrained_backbone(&mut varmap, &path, &Device::Cpu).unwrap();
        assert_eq!(copied, 1);

        let data = varmap.data().lock().unwrap();
        let sum = data["convnet.conv1.weight"]
            .as_tensor()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(sum, (64 * 3 * 7 * 7) as f32);
    }
}
