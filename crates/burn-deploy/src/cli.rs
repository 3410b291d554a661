//! Command line entry point for folder and file predictions.
//!
//! Downstream binaries embed it with their own backend and model type:
//!
//! ```ignore
//! fn main() -> anyhow::Result<()> {
//!     burn_deploy::cli::run::<NdArray, MyClassifier<NdArray>>(Some(skeleton))
//! }
//! ```
//!
//! Models without a config of their own use [`run_state_dict`] instead.

use crate::dataset::FileBlob;
use crate::deploy::{DeployedModel, PredictInput};
use crate::device::DeviceProvider;
use crate::engine::Prediction;
use crate::model::{FullModel, ImageClassifier};
use anyhow::Context;
use burn::prelude::Backend;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "burn-deploy",
    version,
    about = "Classify images with a deployed burn model"
)]
pub struct PredictArgs {
    /// Deployment config (.toml or .json).
    #[arg(long)]
    pub config: PathBuf,
    /// Directory substituted for the `project_root` placeholder of the weight path.
    #[arg(long, env = "PROJECT_ROOT")]
    pub project_root: Option<PathBuf>,
    /// Classify every .jpg and .png file of this directory.
    #[arg(long, conflicts_with = "files", required_unless_present = "files")]
    pub folder: Option<PathBuf>,
    /// Classify these files, in the order given.
    #[arg(long = "file", num_args = 1..)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PredictOutput {
    predictions: Vec<Prediction>,
}

/// Parses the process arguments, runs the prediction and prints `{"predictions": [...]}`.
pub fn run<B, M>(skeleton: Option<M>) -> anyhow::Result<()>
where
    B: DeviceProvider,
    M: FullModel<B>,
{
    init_logger();
    let predictions = run_with_args::<B, M>(PredictArgs::parse(), skeleton)?;
    print_predictions(predictions)
}

/// [`run`] for models that can only be loaded into `skeleton`, with `state_dict` configs.
pub fn run_state_dict<B, M>(skeleton: M) -> anyhow::Result<()>
where
    B: DeviceProvider,
    M: ImageClassifier<B>,
{
    init_logger();
    let args = PredictArgs::parse();
    let deployed = DeployedModel::<B, M>::deploy_state_dict(
        &args.config,
        args.project_root.as_deref(),
        skeleton,
    )
    .with_context(|| format!("Failed to deploy model from {}", args.config.display()))?;
    print_predictions(predict_with_args(&deployed, &args)?)
}

pub fn run_with_args<B, M>(
    args: PredictArgs,
    skeleton: Option<M>,
) -> anyhow::Result<Vec<Prediction>>
where
    B: DeviceProvider,
    M: FullModel<B>,
{
    let deployed =
        DeployedModel::<B, M>::deploy(&args.config, args.project_root.as_deref(), skeleton)
            .with_context(|| format!("Failed to deploy model from {}", args.config.display()))?;
    predict_with_args(&deployed, &args)
}

/// Classifies the folder or files named by `args` with an already deployed model.
pub fn predict_with_args<B, M>(
    deployed: &DeployedModel<B, M>,
    args: &PredictArgs,
) -> anyhow::Result<Vec<Prediction>>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    let predictions = match &args.folder {
        Some(folder) => deployed.predict(PredictInput::folder(folder)),
        None => {
            let blobs = args
                .files
                .iter()
                .map(|path| -> anyhow::Result<FileBlob> {
                    let bytes = std::fs::read(path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    Ok(FileBlob::from_bytes(path.display().to_string(), bytes))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            deployed.predict(PredictInput::list(&blobs))
        }
    };
    let predictions = predictions.context("Prediction failed")?;
    Ok(predictions)
}

fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

fn print_predictions(predictions: Vec<Prediction>) -> anyhow::Result<()> {
    let output = serde_json::to_string(&PredictOutput { predictions })
        .context("Failed to serialize predictions")?;
    println!("{output}");
    Ok(())
}
