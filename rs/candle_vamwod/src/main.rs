//! VAMWOD: visual attention-based webpage object detection with Candle
//!
//! This binary trains, evaluates and runs the detection head that labels the
//! candidate boxes of webpage screenshots.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_eval;
mod cmd_predict;
mod cmd_train;
mod config;
mod dataset;
mod model;
mod preprocess;

use std::path::{Path, PathBuf};

use candle_core::{Device, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cmd_eval::EvalArgs;
use crate::cmd_predict::PredictArgs;
use crate::cmd_train::TrainArgs;
use crate::config::VamwodConfig;

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the model on the train split, validating every epoch.
    Train(TrainArgs),
    /// Per-class accuracy on a dataset split.
    Eval(EvalArgs),
    /// Label the candidate boxes of one screenshot.
    Predict(PredictArgs),
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Model configuration in JSON; defaults to `config.json` next to the
    /// weights, then to the built-in settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to model weights, in safetensors format. For `train` this resumes
    /// from a checkpoint.
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn model_path(&self) -> anyhow::Result<PathBuf> {
        let path = self
            .model
            .clone()
            .unwrap_or_else(|| PathBuf::from("checkpoints/best.safetensors"));
        if !path.exists() {
            anyhow::bail!(
                "Model weights not found at {:?}. Please provide a valid model path with --model, \
                or train a model first.",
                path
            );
        }
        Ok(path)
    }

    fn load_config(&self, model_path: Option<&Path>) -> anyhow::Result<VamwodConfig> {
        let sibling = model_path
            .and_then(Path::parent)
            .map(|dir| dir.join("config.json"))
            .filter(|p| p.exists());
        match self.config.clone().or(sibling) {
            Some(path) => {
                info!("loading config from {path:?}");
                VamwodConfig::load(&path)
            }
            None => Ok(VamwodConfig::default()),
        }
    }
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let device = device(cli.cpu)?;
    info!("Using device: {:?}", device);

    match &cli.command {
        Command::Train(args) => {
            let config = cli.load_config(None)?;
            cmd_train::run(args, &config, cli.model.as_deref(), &device)
        }
        Command::Eval(args) => {
            let model_path = cli.model_path()?;
            let config = cli.load_config(Some(&model_path))?;
            cmd_eval::run(args, &config, &model_path, &device)
        }
        Command::Predict(args) => {
            let model_path = cli.model_path()?;
            let config = cli.load_config(Some(&model_path))?;
            cmd_predict::run(args, &config, &model_path, &device)
        }
    }
}
