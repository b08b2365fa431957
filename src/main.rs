//! EO Change-Detection Pipeline CLI
//!
//! Resumable batch pipeline: acquire Sentinel-2 imagery per (cell, year),
//! persist it, and derive year-over-year change masks.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eo_change::plan::{plan_tasks, remaining_tasks, RunPlan};
use eo_change::{build_runtime, CheckpointStore, Config, PipelineController, ProcessingMode};

#[derive(Parser)]
#[command(name = "eo-change")]
#[command(about = "Resumable Sentinel-2 change-detection pipeline", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the configured processing mode
    #[arg(long, global = true)]
    mode: Option<ModeArg>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline to completion (default if no command specified)
    Run {
        /// Start fresh, discarding existing checkpoints
        #[arg(long)]
        no_resume: bool,
    },

    /// Show per-stage progress and exit
    Status,

    /// Reset failed tasks to pending and re-run them
    RetryFailed,

    /// Analyze the planned work without processing
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    LocalOnly,
    DatabaseOnly,
    Hybrid,
}

impl From<ModeArg> for ProcessingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::LocalOnly => ProcessingMode::LocalOnly,
            ModeArg::DatabaseOnly => ProcessingMode::DatabaseOnly,
            ModeArg::Hybrid => ProcessingMode::Hybrid,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run { no_resume: false }) => {
            run_command(cli.config, cli.mode, false)?;
        }

        Some(Commands::Run { no_resume: true }) => {
            run_command(cli.config, cli.mode, true)?;
        }

        Some(Commands::Status) => {
            status_command(cli.config, cli.mode)?;
        }

        Some(Commands::RetryFailed) => {
            retry_failed_command(cli.config, cli.mode)?;
        }

        Some(Commands::Plan) => {
            plan_command(cli.config)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, mode: Option<ModeArg>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;
    if let Some(mode) = mode {
        config.storage.mode = mode.into();
    }
    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, mode: Option<ModeArg>, no_resume: bool) -> Result<()> {
    let mut config = load_config(&config_path, mode)?;
    if no_resume {
        config.processing.resume = false;
    }

    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        let mut controller = PipelineController::new(config)?;

        // SIGINT requests a cooperative stop: no new tasks are dispatched,
        // in-flight tasks finish and the checkpoint reflects true state.
        let control = controller.control();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, finishing in-flight tasks before stopping");
                control.request_stop();
            }
        });

        let summary = controller.run_once().await?;
        println!("{}", summary);

        if summary.failed_tasks() > 0 {
            tracing::warn!(
                "run finished with {} failed tasks; use `retry-failed` to re-run them",
                summary.failed_tasks()
            );
            std::process::exit(1);
        }
        Ok(())
    })
}

fn status_command(config_path: PathBuf, mode: Option<ModeArg>) -> Result<()> {
    let config = load_config(&config_path, mode)?;
    let controller = PipelineController::new(config)?;

    println!("\nPipeline Status:");
    println!("{}", "=".repeat(50));
    for row in controller.status()? {
        println!("{}", row);
    }
    Ok(())
}

fn retry_failed_command(config_path: PathBuf, mode: Option<ModeArg>) -> Result<()> {
    let config = load_config(&config_path, mode)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        let mut controller = PipelineController::new(config)?;

        let control = controller.control();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                control.request_stop();
            }
        });

        let summary = controller.retry_failed().await?;
        println!("{}", summary);
        Ok(())
    })
}

fn plan_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    let plan = RunPlan::build(&config.coverage.cell_ids, &config.coverage.years)?;
    let store = CheckpointStore::open(config.storage.checkpoints_dir())?;

    println!("\n=== Work Analysis ===");
    println!("Cells: {}", config.coverage.cell_ids.len());
    println!("Years: {:?}", config.coverage.years);
    println!("Stage groups: {}", plan.groups.len());

    let mut total_planned = 0;
    let mut total_remaining = 0;
    for group in &plan.groups {
        let planned = plan_tasks(group.stage, group.period, &config.coverage.cell_ids);
        let remaining = match store.load_existing(group.stage, group.period)? {
            Some(checkpoint) => remaining_tasks(&checkpoint, &planned).len(),
            None => planned.len(),
        };
        println!(
            "{}/{}: {} tasks, {} remaining",
            group.stage,
            group.period,
            planned.len(),
            remaining
        );
        total_planned += planned.len();
        total_remaining += remaining;
    }

    println!(
        "\nTotal: {} tasks, {} remaining ({} already done)",
        total_planned,
        total_remaining,
        total_planned - total_remaining
    );
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("  Mode: {}", config.storage.mode);
    println!("  Data directory: {}", config.storage.data_dir.display());
    println!("  Cells: {:?}", config.coverage.cell_ids);
    println!("  Years: {:?}", config.coverage.years);
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let config = Config::default();
    std::fs::write(&output, config.to_yaml()?)?;

    println!("Sample configuration written to {}", output.display());
    println!("Edit the coverage, storage and commands sections, then run:");
    println!("  eo-change --config {} validate", output.display());
    Ok(())
}
