use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

use dicom_seg_dataset::{
    config::{ConfigError, PipelineConfig},
    cropper::{ComponentCropper, CropError},
    enums::{Connectivity, PhaseNaming},
    orchestrator::{CaseOrchestrator, PipelineError},
};

#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert case directories of DICOM series into a raw dataset.
    Convert(ConvertArgs),
    /// Crop a converted dataset around each connected mask region.
    Crop(CropArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// TOML file with the run settings; flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding one sub-directory per case.
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Root under which the dataset directory is created.
    #[arg(short, long, env = "nnUNet_raw")]
    target: Option<PathBuf>,

    #[arg(long, value_enum)]
    phase_naming: Option<PhaseNaming>,

    /// Slices per output volume; 0 keeps every informative slice.
    #[arg(long)]
    target_depth: Option<usize>,

    /// Seed for the train/test split.
    #[arg(long)]
    seed: Option<u64>,

    /// Worker threads; defaults to one per core.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Remove an existing dataset directory first.
    #[arg(long)]
    fresh: bool,

    /// Delete the raw case directory once all its phases were written.
    #[arg(long)]
    delete_origin_data: bool,
}

#[derive(Args, Debug)]
struct CropArgs {
    /// Converted dataset directory, e.g. `nnUNet_raw/Dataset801_SBRTest`.
    dataset: PathBuf,

    /// Slices kept on either side of a region.
    #[arg(short, long, default_value_t = dicom_seg_dataset::cropper::DEFAULT_MARGIN)]
    margin: usize,

    #[arg(long, value_enum, default_value_t = Connectivity::Full)]
    connectivity: Connectivity,

    /// Remove an existing cropped directory first.
    #[arg(long)]
    fresh: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Crop(#[from] CropError),
}

impl ConvertArgs {
    fn into_config(self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(source) = self.source {
            config.source_root = source;
        }
        if let Some(target) = self.target {
            config.target_root = target;
        }
        if let Some(naming) = self.phase_naming {
            config.phase_naming = naming;
        }
        if let Some(depth) = self.target_depth {
            config.target_depth = depth;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        config.fresh_output |= self.fresh;
        config.delete_origin_data |= self.delete_origin_data;
        config.validate()?;
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Convert(args) => {
            let config = args.into_config()?;
            CaseOrchestrator::with_dicom(config).run()?;
        }
        Command::Crop(args) => {
            ComponentCropper::new(args.connectivity)
                .with_margin(args.margin)
                .crop_dataset(&args.dataset, args.fresh)?;
        }
    }
    Ok(())
}

/// `RUST_LOG` directives when given and valid, `info` otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn main() -> ExitCode {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(directives.as_deref()))
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
