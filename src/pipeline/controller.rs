//! Top-level pipeline orchestration.
//!
//! The controller sequences stages across periods: for each configured year
//! in ascending order, Acquire then Persist; once a year and its predecessor
//! both have terminal Persist state, DeriveChange runs for the pair with its
//! task set gated by the dependency resolver. Periods are processed
//! sequentially, trading pipelined throughput for a simple dependency graph.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Config;
use crate::handler::HandlerSet;
use crate::pipeline::progress::StageProgress;
use crate::pipeline::runner::{ControlSignal, StageRunner};
use crate::plan::{self, plan_tasks, remaining_tasks, PlanGroup, RunPlan};
use crate::task::{Period, Stage};

/// Run-level state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Planning,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Planning => "planning",
            PipelineState::Running => "running",
            PipelineState::Paused => "paused",
            PipelineState::Completed => "completed",
            PipelineState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Final report of a controller run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: PipelineState,
    pub stages: Vec<StageProgress>,
}

impl RunSummary {
    /// Total failed tasks across all stages of the plan.
    pub fn failed_tasks(&self) -> usize {
        self.stages.iter().map(|stage| stage.failed).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline {}", self.state)?;
        for stage in &self.stages {
            writeln!(f, "  {}", stage)?;
        }
        Ok(())
    }
}

/// Orchestrates the full run: planning, stage sequencing, dependency
/// resolution, retry and status reporting.
pub struct PipelineController {
    config: Config,
    store: Arc<CheckpointStore>,
    handlers: HandlerSet,
    signal: ControlSignal,
    runner: StageRunner,
    state: PipelineState,
    checkpoints: HashMap<(Stage, Period), Checkpoint>,
}

impl PipelineController {
    /// Build a controller with handlers selected by the configured mode.
    pub fn new(config: Config) -> Result<Self> {
        let handlers = HandlerSet::from_config(&config);
        Self::with_handlers(config, handlers)
    }

    /// Build a controller with explicit handlers (used by embedders and
    /// tests to supply their own collaborators).
    pub fn with_handlers(config: Config, handlers: HandlerSet) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(CheckpointStore::open(config.storage.checkpoints_dir())?);
        let signal = ControlSignal::new();
        let runner = StageRunner::new(store.clone(), signal.clone(), &config.processing);

        Ok(Self {
            config,
            store,
            handlers,
            signal,
            runner,
            state: PipelineState::Idle,
            checkpoints: HashMap::new(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle for requesting a cooperative pause or stop, safe to share with
    /// a signal handler.
    pub fn control(&self) -> ControlSignal {
        self.signal.clone()
    }

    /// Execute the full plan to completion and return the final snapshot.
    ///
    /// Task failures are recorded in checkpoints and do not interrupt the
    /// run; only checkpoint store I/O and plan construction abort it.
    pub async fn run_once(&mut self) -> Result<RunSummary> {
        self.signal.resume();
        self.state = PipelineState::Planning;

        let plan = match self.prepare_plan() {
            Ok(plan) => plan,
            Err(e) => {
                self.state = PipelineState::Aborted;
                return Err(e);
            }
        };

        tracing::info!(
            "starting pipeline run: mode={}, years={:?}, cells={:?}, resume={}",
            self.config.storage.mode,
            self.config.coverage.years,
            self.config.coverage.cell_ids,
            self.config.processing.resume,
        );
        self.state = PipelineState::Running;

        if let Err(e) = self.execute(&plan).await {
            self.state = PipelineState::Aborted;
            return Err(e);
        }

        self.state = if self.signal.is_paused() {
            PipelineState::Paused
        } else if self.signal.is_stopped() {
            PipelineState::Idle
        } else {
            PipelineState::Completed
        };

        let summary = self.summary()?;
        tracing::info!(
            "pipeline run finished ({}): {} failed tasks",
            self.state,
            summary.failed_tasks()
        );
        Ok(summary)
    }

    /// Reset every Failed task in the plan back to Pending, then re-run the
    /// remaining work. Completed and Skipped tasks are untouched.
    pub async fn retry_failed(&mut self) -> Result<RunSummary> {
        let plan = self.build_plan()?;

        let mut total_reset = 0;
        for group in &plan.groups {
            let key = (group.stage, group.period);
            let existing = match self.checkpoints.remove(&key) {
                Some(checkpoint) => Some(checkpoint),
                None => self.store.load_existing(group.stage, group.period)?,
            };
            let Some(mut checkpoint) = existing else {
                continue;
            };

            let reset = checkpoint.reset_failed();
            if reset > 0 {
                self.store.save(&checkpoint)?;
                tracing::info!(
                    "reset {} failed tasks in {}/{}",
                    reset,
                    group.stage,
                    group.period
                );
                total_reset += reset;
            }
            self.checkpoints.insert(key, checkpoint);
        }

        tracing::info!("retrying {} failed tasks", total_reset);
        self.run_once().await
    }

    /// Per-(stage, period) progress over the whole plan, computed from live
    /// checkpoints where available and disk otherwise.
    pub fn status(&self) -> Result<Vec<StageProgress>> {
        let plan = self.build_plan()?;

        let mut rows = Vec::with_capacity(plan.groups.len());
        for group in &plan.groups {
            let key = (group.stage, group.period);
            let progress = if let Some(checkpoint) = self.checkpoints.get(&key) {
                StageProgress::from_checkpoint(checkpoint)
            } else if let Some(checkpoint) =
                self.store.load_existing(group.stage, group.period)?
            {
                StageProgress::from_checkpoint(&checkpoint)
            } else {
                // Not started yet: report the planned totals at zero.
                let planned =
                    plan_tasks(group.stage, group.period, &self.config.coverage.cell_ids);
                StageProgress::from_checkpoint(&Checkpoint::new(
                    group.stage,
                    group.period,
                    &planned,
                ))
            };
            rows.push(progress);
        }
        Ok(rows)
    }

    fn summary(&self) -> Result<RunSummary> {
        Ok(RunSummary {
            state: self.state,
            stages: self.status()?,
        })
    }

    fn build_plan(&self) -> Result<RunPlan> {
        RunPlan::build(&self.config.coverage.cell_ids, &self.config.coverage.years)
            .context("failed to build run plan")
    }

    fn prepare_plan(&mut self) -> Result<RunPlan> {
        let plan = self.build_plan()?;
        if !self.config.processing.resume {
            self.fresh_start(&plan)?;
        }
        Ok(plan)
    }

    /// Explicit fresh-start reset: recreate every checkpoint in the plan
    /// with all tasks Pending.
    fn fresh_start(&mut self, plan: &RunPlan) -> Result<()> {
        tracing::info!(
            "fresh start requested, resetting {} checkpoints",
            plan.groups.len()
        );
        self.checkpoints.clear();
        for group in &plan.groups {
            let planned = plan_tasks(group.stage, group.period, &self.config.coverage.cell_ids);
            let checkpoint = self.store.reset(group.stage, group.period, &planned)?;
            self.checkpoints.insert((group.stage, group.period), checkpoint);
        }
        Ok(())
    }

    async fn execute(&mut self, plan: &RunPlan) -> Result<()> {
        for group in &plan.groups {
            if self.signal.should_halt() {
                tracing::info!(
                    "halt requested, stopping before {}/{}",
                    group.stage,
                    group.period
                );
                break;
            }
            self.run_group(group).await?;
        }
        Ok(())
    }

    async fn run_group(&mut self, group: &PlanGroup) -> Result<()> {
        let planned = plan_tasks(group.stage, group.period, &self.config.coverage.cell_ids);
        let key = (group.stage, group.period);

        let mut checkpoint = match self.checkpoints.remove(&key) {
            Some(checkpoint) => checkpoint,
            None => self.store.load(group.stage, group.period, &planned)?,
        };

        let recovered = checkpoint.recover_in_flight();
        if recovered > 0 {
            tracing::info!(
                "recovered {} in-flight tasks in {}/{}",
                recovered,
                group.stage,
                group.period
            );
        }

        let added = checkpoint.ensure_tasks(&planned);
        if added > 0 {
            tracing::info!(
                "planned {} new tasks in {}/{}",
                added,
                group.stage,
                group.period
            );
        }

        if let (Stage::DeriveChange, Period::Pair(earlier, later)) = (group.stage, group.period) {
            let persist_a = self.persist_snapshot(earlier)?;
            let persist_b = self.persist_snapshot(later)?;
            let eligibility =
                plan::eligible(&self.config.coverage.cell_ids, &persist_a, &persist_b);
            let (unskipped, skipped) = eligibility.apply(&mut checkpoint);
            if unskipped + skipped > 0 {
                tracing::info!(
                    "dependency resolution for {}/{}: {} ready again, {} skipped",
                    group.stage,
                    group.period,
                    unskipped,
                    skipped
                );
            }
        }

        let remaining = remaining_tasks(&checkpoint, &planned);
        if remaining.is_empty() {
            tracing::info!(
                "{}/{} has no eligible work ({} completed, {} failed, {} skipped)",
                group.stage,
                group.period,
                checkpoint.completed_tasks,
                checkpoint.failed_tasks,
                checkpoint.skipped_tasks
            );
            self.store.save(&checkpoint)?;
            self.checkpoints.insert(key, checkpoint);
            return Ok(());
        }

        let handler = self.handlers.for_stage(group.stage);
        let concurrency = self.config.processing.concurrency_for(group.stage);
        let result = self
            .runner
            .run_batch(&mut checkpoint, remaining, handler, concurrency)
            .await;

        // Keep the in-memory checkpoint either way so status stays truthful.
        match result {
            Ok(stats) => {
                tracing::info!("{}/{}: {}", group.stage, group.period, stats);
                self.checkpoints.insert(key, checkpoint);
                Ok(())
            }
            Err(e) => {
                self.checkpoints.insert(key, checkpoint);
                Err(e)
            }
        }
    }

    /// Current Persist checkpoint for a year, from memory or disk. Missing
    /// files yield an all-Pending view, which blocks dependent cells.
    fn persist_snapshot(&mut self, year: i32) -> Result<Checkpoint> {
        let key = (Stage::Persist, Period::Year(year));
        if let Some(checkpoint) = self.checkpoints.get(&key) {
            return Ok(checkpoint.clone());
        }

        let planned = plan_tasks(
            Stage::Persist,
            Period::Year(year),
            &self.config.coverage.cell_ids,
        );
        let checkpoint = self
            .store
            .load(Stage::Persist, Period::Year(year), &planned)?;
        self.checkpoints.insert(key, checkpoint.clone());
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_controller_starts_idle() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();

        let controller = PipelineController::new(config).unwrap();
        assert_eq!(controller.state(), PipelineState::Idle);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.coverage.cell_ids.clear();
        assert!(PipelineController::new(config).is_err());
    }

    #[test]
    fn test_status_before_any_run_reports_planned_totals() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.coverage.cell_ids = vec![1, 2];
        config.coverage.years = vec![2023, 2024];

        let controller = PipelineController::new(config).unwrap();
        let status = controller.status().unwrap();

        // acquire+persist per year, one derive pair.
        assert_eq!(status.len(), 5);
        assert!(status.iter().all(|row| row.total == 2 && row.completed == 0));
    }

    #[test]
    fn test_run_summary_display() {
        let summary = RunSummary {
            state: PipelineState::Completed,
            stages: Vec::new(),
        };
        assert!(format!("{}", summary).contains("Pipeline completed"));
    }
}
