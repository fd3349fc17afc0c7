//! Train subcommand: fit the detection head on the train split.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::Args;
use tracing::{info, warn};
use webtools::{BackgroundCap, Split};

use crate::cmd_eval::evaluate;
use crate::config::VamwodConfig;
use crate::dataset::{DataArgs, SampleLoader, WebDataset};
use crate::model::{load_pretrained_backbone, Vamwod};

/// Hub repository with ImageNet ResNet-18 weights
const BACKBONE_REPO: &str = "timm/resnet18.a1_in1k";

/// Arguments for the train subcommand
#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Number of passes over the train split.
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 5e-4)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f64,

    /// Directory for checkpoints and the training config.
    #[arg(long, short, default_value = "checkpoints")]
    pub output_dir: PathBuf,

    /// ImageNet ResNet-18 safetensors; fetched from the hub when omitted.
    #[arg(long)]
    pub backbone: Option<PathBuf>,

    /// Start from random backbone weights.
    #[arg(long)]
    pub no_pretrained: bool,
}

impl TrainArgs {
    fn backbone_path(&self) -> anyhow::Result<PathBuf> {
        match &self.backbone {
            Some(path) => Ok(path.clone()),
            None => {
                let api = hf_hub::api::sync::Api::new()?;
                let api = api.model(BACKBONE_REPO.to_string());
                Ok(api.get("model.safetensors")?)
            }
        }
    }
}

fn dataset(
    args: &TrainArgs,
    split: Split,
    ids: Vec<String>,
    config: &VamwodConfig,
    device: &Device,
) -> anyhow::Result<WebDataset> {
    let (cap, batch_size) = match split {
        Split::Train => (BackgroundCap::from_signed(args.data.background_cap), args.batch_size),
        Split::Val | Split::Test => (BackgroundCap::Unlimited, 1),
    };
    let loader = SampleLoader::new(
        &args.data.data_dir,
        split,
        cap,
        config.img_size,
        config.normalize_input,
        device,
    )?;
    WebDataset::new(
        loader,
        ids,
        batch_size,
        config.n_context,
        args.data.seed,
        args.data.workers,
    )
}

/// Scalar value of a loss, rejected when it is not finite.
fn checked_loss_value(loss: &Tensor) -> anyhow::Result<f32> {
    let value = loss.to_scalar::<f32>()?;
    if !value.is_finite() {
        anyhow::bail!("non-finite loss {value}");
    }
    Ok(value)
}

/// Run the train subcommand
///
/// `init` resumes from a VAMWOD checkpoint instead of the pretrained backbone.
pub fn run(
    args: &TrainArgs,
    config: &VamwodConfig,
    init: Option<&Path>,
    device: &Device,
) -> anyhow::Result<()> {
    if config.n_additional_feat > 0 {
        anyhow::bail!("the sample format carries no additional box features");
    }
    if !args.data.data_dir.is_dir() {
        anyhow::bail!("data directory not found: {:?}", args.data.data_dir);
    }

    // Overlapping splits are rejected here, before any sample is read.
    let splits = args.data.load_splits()?;
    let train = dataset(args, Split::Train, splits.ids(Split::Train).to_vec(), config, device)?;
    let val = dataset(args, Split::Val, splits.ids(Split::Val).to_vec(), config, device)?;
    info!("{} train / {} val samples", train.len(), val.len());
    if train.is_empty() {
        anyhow::bail!("train split is empty");
    }

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Vamwod::load(vb, config)?;
    info!(
        "model: spatial scale {}, {} own features, classifier input {}",
        model.spatial_scale(),
        model.n_feat(),
        model.decoder_in_features()
    );

    match init {
        Some(path) => {
            info!("resuming from {path:?}");
            varmap.load(path)?;
        }
        None if args.no_pretrained => warn!("training the backbone from scratch"),
        None => {
            let path = args.backbone_path()?;
            let copied = load_pretrained_backbone(&mut varmap, &path, device)?;
            info!("copied {copied} pretrained backbone tensors from {path:?}");
        }
    }

    let params = ParamsAdamW {
        lr: args.learning_rate,
        weight_decay: args.weight_decay,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;

    std::fs::create_dir_all(&args.output_dir)?;
    std::fs::write(
        args.output_dir.join("config.json"),
        serde_json::to_string_pretty(config)?,
    )?;

    let mut best = f32::NEG_INFINITY;
    for epoch in 0..args.epochs {
        let start = Instant::now();
        let batches = train.batches(epoch);
        let mut total_loss = 0.0;

        for (idx, indices) in batches.iter().enumerate() {
            let batch = train.load_batch(epoch, indices)?;
            let logits = model.forward_t(&batch.images, &batch.boxes, None, &batch.context, true)?;
            let loss_tensor = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
            // Checked before stepping so a bad batch never reaches the weights.
            let loss = checked_loss_value(&loss_tensor)
                .map_err(|e| anyhow::anyhow!("epoch {epoch}, batch {:?}: {e}", batch.ids))?;
            optimizer.backward_step(&loss_tensor)?;
            total_loss += loss;
            if (idx + 1) % 50 == 0 {
                info!("epoch {epoch} [{}/{}] loss {loss:.4}", idx + 1, batches.len());
            }
        }
        info!(
            "epoch {epoch} done in {:.1}s, mean loss {:.4}",
            start.elapsed().as_secs_f32(),
            total_loss / batches.len().max(1) as f32
        );

        let checkpoint = args.output_dir.join(format!("vamwod_epoch_{epoch}.safetensors"));
        varmap.save(&checkpoint)?;

        if val.is_empty() {
            continue;
        }
        let accuracy = evaluate(&model, &val)?;
        accuracy.log_summary("val", &config.class_names);
        if accuracy.mean() > best {
            best = accuracy.mean();
            varmap.save(args.output_dir.join("best.safetensors"))?;
            info!("new best validation accuracy {:.2}%", 100.0 * best);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;

    #[test]
    fn test_checked_loss_value() {
        let loss = Tensor::new(0.5f32, &Device::Cpu).unwrap();
        assert_eq!(checked_loss_value(&loss).unwrap(), 0.5);
        let nan = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        assert!(checked_loss_value(&nan).is_err());
    }

    #[test]
    fn test_non_finite_loss_leaves_weights_untouched() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(2, "w", Init::Const(1.0)).unwrap();
        let mut optimizer = AdamW::new(varmap.all_vars(), ParamsAdamW::default()).unwrap();

        let inf = Tensor::new(&[f32::INFINITY, 0.0], &Device::Cpu).unwrap();
        let loss = w.mul(&inf).unwrap().sum_all().unwrap();
        if checked_loss_value(&loss).is_ok() {
            optimizer.backward_step(&loss).unwrap();
        }
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }
}
