//! Eval subcommand: per-class top-1 accuracy on a dataset split.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{Device, D};
use clap::Args;
use tracing::info;
use webtools::{BackgroundCap, ClassAccuracy, Split};

use crate::cmd_predict::load_model;
use crate::config::VamwodConfig;
use crate::dataset::{DataArgs, SampleLoader, WebDataset};
use crate::model::Vamwod;

/// Arguments for the eval subcommand
#[derive(Args, Debug)]
pub struct EvalArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Split to evaluate.
    #[arg(long, value_parser = parse_split, default_value = "test")]
    pub split: Split,

    /// Output directory for evaluation results.
    #[arg(long, short, default_value = "eval_output")]
    pub output_dir: PathBuf,
}

pub fn parse_split(s: &str) -> Result<Split, String> {
    match s {
        "train" => Ok(Split::Train),
        "val" => Ok(Split::Val),
        "test" => Ok(Split::Test),
        other => Err(format!("unknown split {other:?}, expected train, val or test")),
    }
}

/// Score every image of `dataset` with the model in inference mode.
pub fn evaluate(model: &Vamwod, dataset: &WebDataset) -> anyhow::Result<ClassAccuracy> {
    let mut accuracy = ClassAccuracy::new(model.config().n_classes);
    let start = Instant::now();
    let num_batches = dataset.num_batches();

    for (idx, indices) in dataset.batches(0).iter().enumerate() {
        let batch = dataset.load_batch(0, indices)?;
        let logits = model.forward_t(&batch.images, &batch.boxes, None, &batch.context, false)?;
        let scores: Vec<Vec<f32>> = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2()?;

        let labels = batch.box_batch.labels();
        for range in batch.box_batch.sample_ranges() {
            accuracy.update(&scores[range.clone()], &labels[range]);
        }

        if (idx + 1) % 100 == 0 || idx + 1 == num_batches {
            info!(
                "[{}/{}] evaluated ({:.1} batches/s)",
                idx + 1,
                num_batches,
                (idx + 1) as f32 / start.elapsed().as_secs_f32()
            );
        }
    }
    Ok(accuracy)
}

/// Evaluation dataset: no background cap, batch size 1, file order.
pub fn eval_dataset(
    data: &DataArgs,
    split: Split,
    config: &VamwodConfig,
    device: &Device,
) -> anyhow::Result<WebDataset> {
    let splits = data.load_splits()?;
    let loader = SampleLoader::new(
        &data.data_dir,
        split,
        BackgroundCap::Unlimited,
        config.img_size,
        config.normalize_input,
        device,
    )?;
    WebDataset::new(
        loader,
        splits.ids(split).to_vec(),
        1,
        config.n_context,
        data.seed,
        data.workers,
    )
}

/// Run the eval subcommand
pub fn run(
    args: &EvalArgs,
    config: &VamwodConfig,
    model_path: &Path,
    device: &Device,
) -> anyhow::Result<()> {
    if config.n_additional_feat > 0 {
        anyhow::bail!("the sample format carries no additional box features");
    }
    if !args.data.data_dir.is_dir() {
        anyhow::bail!("data directory not found: {:?}", args.data.data_dir);
    }
    info!("evaluating {model_path:?} on {} split of {:?}", args.split, args.data.data_dir);

    let model = load_model(model_path, config, device)?;
    let dataset = eval_dataset(&args.data, args.split, config, device)?;
    info!("{} images", dataset.len());

    let accuracy = evaluate(&model, &dataset)?;
    accuracy.log_summary(&args.split.to_string(), &config.class_names);

    std::fs::create_dir_all(&args.output_dir)?;
    let results_file = args.output_dir.join(format!("eval_results_{}.json", args.split));
    let results = serde_json::json!({
        "model": model_path.to_string_lossy(),
        "split": args.split,
        "accuracy": accuracy.report(&config.class_names),
    });
    let file = std::fs::File::create(&results_file)?;
    serde_json::to_writer_pretty(file, &results)?;
    info!("evaluation metrics saved to {results_file:?}");

    Ok(())
}
