//! Durable checkpoint persistence, one JSON file per (stage, period).
//!
//! Saves are atomic with respect to process crash: the serialized checkpoint
//! is written to a temporary file in the same directory, fsynced, then
//! renamed over the canonical path. A reader (including the external
//! monitoring dashboard) never observes a partially-written checkpoint.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::checkpoint::Checkpoint;
use crate::task::{Period, Stage, TaskSpec};

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (and create if necessary) a checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Canonical file path for a (stage, period) checkpoint.
    pub fn path_for(&self, stage: Stage, period: Period) -> PathBuf {
        self.dir.join(format!("{}_{}.json", stage, period))
    }

    /// Load the persisted checkpoint, or build a fresh all-Pending one from
    /// the planned task set when no file exists yet.
    ///
    /// Counters are recomputed from the task map on load; in-flight recovery
    /// is a separate, explicit step taken by the controller.
    pub fn load(&self, stage: Stage, period: Period, planned: &[TaskSpec]) -> Result<Checkpoint> {
        match self.load_existing(stage, period)? {
            Some(checkpoint) => Ok(checkpoint),
            None => Ok(Checkpoint::new(stage, period, planned)),
        }
    }

    /// Load the persisted checkpoint if one exists on disk.
    pub fn load_existing(&self, stage: Stage, period: Period) -> Result<Option<Checkpoint>> {
        let path = self.path_for(stage, period);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let mut checkpoint: Checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;

        if checkpoint.stage_name != stage || checkpoint.period != period {
            bail!(
                "checkpoint {} holds {}/{}, expected {}/{}",
                path.display(),
                checkpoint.stage_name,
                checkpoint.period,
                stage,
                period
            );
        }

        if checkpoint.recount() {
            tracing::warn!(
                "checkpoint {} had inconsistent counters, recomputed from tasks",
                path.display()
            );
        }

        tracing::debug!(
            "loaded checkpoint {}/{}: {}/{} completed",
            stage,
            period,
            checkpoint.completed_tasks,
            checkpoint.total_tasks
        );
        Ok(Some(checkpoint))
    }

    /// Atomically persist a checkpoint: temp file + fsync + rename.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(checkpoint.stage_name, checkpoint.period);
        let tmp = self.dir.join(format!(
            ".{}_{}.tmp",
            checkpoint.stage_name, checkpoint.period
        ));

        let json = serde_json::to_vec_pretty(checkpoint).context("failed to serialize checkpoint")?;

        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create temp checkpoint {}", tmp.display()))?;
        file.write_all(&json)
            .with_context(|| format!("failed to write temp checkpoint {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp checkpoint {}", tmp.display()))?;
        drop(file);

        fs::rename(&tmp, &path).with_context(|| {
            format!(
                "failed to rename {} -> {}",
                tmp.display(),
                path.display()
            )
        })?;

        tracing::trace!(
            "saved checkpoint {}/{}: {}/{} completed",
            checkpoint.stage_name,
            checkpoint.period,
            checkpoint.completed_tasks,
            checkpoint.total_tasks
        );
        Ok(())
    }

    /// Fresh-start reset: recreate the checkpoint with every planned task
    /// Pending and persist it, discarding any previous state.
    pub fn reset(&self, stage: Stage, period: Period, planned: &[TaskSpec]) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(stage, period, planned);
        self.save(&checkpoint)?;
        tracing::info!("reset checkpoint {}/{} to {} pending tasks", stage, period, planned.len());
        Ok(checkpoint)
    }
}
