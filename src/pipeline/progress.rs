//! Progress tracking and reporting.
//!
//! `BatchProgress` holds live atomic counters for one running batch;
//! `ProgressReporter` logs them periodically; `StageProgress` is the
//! serializable per-(stage, period) snapshot polled by the monitoring
//! collaborator.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::checkpoint::Checkpoint;
use crate::task::{Period, Stage};

/// Live counters for a single running batch.
#[derive(Debug)]
pub struct BatchProgress {
    total: u64,
    completed: AtomicU64,
    failed: AtomicU64,
    start_time: Instant,
}

impl BatchProgress {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Finished tasks, successful or not.
    pub fn finished(&self) -> u64 {
        self.completed() + self.failed()
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.finished() as f64 / self.total as f64 * 100.0
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Tasks finished per second.
    pub fn rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.finished() as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Periodic progress reporter for a running batch.
pub struct ProgressReporter {
    progress: Arc<BatchProgress>,
    interval_secs: u64,
    label: String,
}

impl ProgressReporter {
    pub fn new(progress: Arc<BatchProgress>, interval_secs: u64, label: impl Into<String>) -> Self {
        Self {
            progress,
            interval_secs,
            label: label.into(),
        }
    }

    /// Log progress on a fixed interval until shutdown.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report();
                }
                _ = shutdown.recv() => {
                    self.report();
                    break;
                }
            }
        }
    }

    fn report(&self) {
        tracing::info!(
            "[{}] {:.1}% ({}/{} finished, {} failed, {:.1} tasks/s, {:.0}s elapsed)",
            self.label,
            self.progress.percent(),
            self.progress.finished(),
            self.progress.total,
            self.progress.failed(),
            self.progress.rate(),
            self.progress.elapsed().as_secs_f64(),
        );
    }
}

/// Snapshot of one (stage, period) checkpoint for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub stage: Stage,
    pub period: Period,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percent: f64,
}

impl StageProgress {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            stage: checkpoint.stage_name,
            period: checkpoint.period,
            total: checkpoint.total_tasks,
            completed: checkpoint.completed_tasks,
            failed: checkpoint.failed_tasks,
            skipped: checkpoint.skipped_tasks,
            percent: checkpoint.percent(),
        }
    }
}

impl std::fmt::Display for StageProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}: {:.1}% ({}/{} completed, {} failed, {} skipped)",
            self.stage,
            self.period,
            self.percent,
            self.completed,
            self.total,
            self.failed,
            self.skipped
        )
    }
}
