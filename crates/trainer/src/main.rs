//! Parley Trainer CLI
//!
//! Trains dialogue and NLU models incrementally from a YAML project.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parley_trainer::{
    DataScope, FileImporter, FinetuneRequest, ModelTrainer, TrainerConfig, TrainingRequest, TrainingResult,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "parley-train")]
#[command(author = "Parley Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental trainer for dialogue and NLU models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train core and NLU, retraining only what changed
    Train(TrainArgs),
    /// Report what a training run would do; exits with the result code
    DryRun(ProjectArgs),
    /// Train only the dialogue policies
    Core(TrainArgs),
    /// Train only the NLU pipeline
    Nlu(TrainArgs),
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Model configuration (recipe, pipeline, policies)
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Domain file
    #[arg(short, long, default_value = "domain.yml")]
    domain: PathBuf,

    /// Training data files or directories
    #[arg(long, default_value = "data")]
    data: Vec<PathBuf>,

    /// Output directory for model archives (overrides settings)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Trainer settings file (TOML)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Force a training run even if nothing changed
    #[arg(long)]
    force: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Name of the archive instead of a generated one
    #[arg(long)]
    fixed_model_name: Option<String>,

    /// Model archive, or directory of archives, to fine-tune from
    #[arg(long)]
    finetune: Option<PathBuf>,

    /// Fraction of the configured epochs to run when fine-tuning
    #[arg(long, default_value = "1.0")]
    epoch_fraction: f64,

    /// Store the NLU training data in the archive
    #[arg(long)]
    persist_nlu_data: bool,
}

impl TrainArgs {
    fn request(&self) -> TrainingRequest {
        TrainingRequest {
            dry_run: false,
            force_training: self.project.force,
            fixed_model_name: self.fixed_model_name.clone(),
            persist_nlu_training_data: self.persist_nlu_data,
            finetune: self
                .finetune
                .as_ref()
                .map(|model| FinetuneRequest::new(model).with_epoch_fraction(self.epoch_fraction)),
        }
    }
}

fn load_settings(args: &ProjectArgs) -> Result<TrainerConfig> {
    let mut config = TrainerConfig::load(args.settings.as_deref()).context("Failed to load trainer settings")?;
    if let Some(out) = &args.out {
        config.training.output_dir = out.clone();
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    Ok(config)
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn trainer(config: &TrainerConfig) -> Result<ModelTrainer> {
    let cache = config.build_cache().context("Failed to open training cache")?;
    Ok(ModelTrainer::new(config.build_index(), cache).with_num_workers(config.training.num_workers))
}

fn importer(args: &ProjectArgs, scope: DataScope) -> FileImporter {
    FileImporter::new(&args.config, Some(args.domain.clone()), args.data.clone()).with_scope(scope)
}

fn report(result: &TrainingResult) {
    match &result.model {
        Some(model) => info!(
            model = %model.path().display(),
            executed = result.executed.len(),
            cache_hits = result.cache_hits.len(),
            "Model ready"
        ),
        None => warn!("No model was trained"),
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let project = match &cli.command {
        Command::Train(args) | Command::Core(args) | Command::Nlu(args) => &args.project,
        Command::DryRun(args) => args,
    };
    let config = load_settings(project)?;
    init_logging(&config.logging.level)?;
    info!("Parley Trainer v{}", env!("CARGO_PKG_VERSION"));

    let trainer = trainer(&config)?;
    match &cli.command {
        Command::DryRun(args) => {
            let request = TrainingRequest {
                dry_run: true,
                force_training: args.force,
                ..TrainingRequest::default()
            };
            let result = trainer.train(&importer(args, DataScope::All), &request)?;
            Ok(ExitCode::from(result.code.clamp(0, 255) as u8))
        }
        Command::Train(args) => {
            let result = trainer.train(&importer(&args.project, DataScope::All), &args.request())?;
            report(&result);
            Ok(ExitCode::SUCCESS)
        }
        Command::Core(args) => {
            let result = trainer.train_core(&importer(&args.project, DataScope::CoreOnly), &args.request())?;
            report(&result);
            Ok(ExitCode::SUCCESS)
        }
        Command::Nlu(args) => {
            let result = trainer.train_nlu(&importer(&args.project, DataScope::NluOnly), &args.request())?;
            report(&result);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
