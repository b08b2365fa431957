//! EO Change-Detection Pipeline
//!
//! Resumable, checkpointed pipeline that ingests Sentinel-2 imagery for a
//! fixed grid of cells over multiple years and derives year-over-year change
//! masks through an external inference model.
//!
//! # Architecture
//!
//! The pipeline decomposes a run into per-stage, per-period, per-cell tasks:
//!
//! - **Checkpoint**: durable per-(stage, period) task state with atomic
//!   on-disk persistence
//! - **Plan**: deterministic task planning, remaining-set computation and
//!   DeriveChange dependency resolution
//! - **Handler**: the uniform adapter boundary over the external download
//!   client, storage writer and inference model
//! - **Pipeline**: bounded-concurrency batch execution and the controller
//!   sequencing stages across periods
//!
//! Completed work is never re-done: every run replans from checkpoints, so a
//! crashed or stopped process resumes where it left off.
//!
//! # Usage
//!
//! ```no_run
//! use eo_change::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(std::path::Path::new("config.yaml"))?;
//!     let summary = run_pipeline(config).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod handler;
pub mod pipeline;
pub mod plan;
pub mod task;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{Config, ProcessingMode};
pub use handler::{ErrorClass, HandlerSet, StageHandler, TaskOutcome};
pub use pipeline::{ControlSignal, PipelineController, PipelineState, RunSummary, StageProgress};
pub use plan::{Eligibility, RunPlan};
pub use task::{Period, Stage, TaskSpec, TaskStatus};

use anyhow::Result;

/// Run the full pipeline to completion with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<RunSummary> {
    let mut controller = PipelineController::new(config)?;
    controller.run_once().await
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
