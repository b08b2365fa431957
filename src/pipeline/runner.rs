//! Bounded-concurrency batch execution for one (stage, period).
//!
//! Tasks are dispatched through `buffer_unordered`; lifecycle events flow
//! over a channel to a single consumer loop that owns the checkpoint, so all
//! mutations and saves for a batch go through one writer. Task failures are
//! recorded and never cancel sibling tasks; only checkpoint save failures
//! abort the batch.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ProcessingConfig;
use crate::handler::{ErrorClass, StageHandler, TaskOutcome};
use crate::pipeline::progress::{BatchProgress, ProgressReporter};
use crate::task::TaskSpec;

const INTENT_RUN: u8 = 0;
const INTENT_PAUSE: u8 = 1;
const INTENT_STOP: u8 = 2;

/// Cooperative pause/stop signal shared between the controller, the runner
/// and the binary's signal handler.
///
/// Both pause and stop prevent new dispatch; in-flight tasks always run to
/// completion. Undispatched tasks simply remain Pending.
#[derive(Debug, Clone, Default)]
pub struct ControlSignal {
    intent: Arc<AtomicU8>,
}

impl ControlSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.intent.store(INTENT_PAUSE, Ordering::Relaxed);
    }

    pub fn request_stop(&self) {
        self.intent.store(INTENT_STOP, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.intent.store(INTENT_RUN, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.intent.load(Ordering::Relaxed) == INTENT_PAUSE
    }

    pub fn is_stopped(&self) -> bool {
        self.intent.load(Ordering::Relaxed) == INTENT_STOP
    }

    /// Whether dispatching new tasks must halt.
    pub fn should_halt(&self) -> bool {
        self.intent.load(Ordering::Relaxed) != INTENT_RUN
    }
}

/// Lifecycle events sent from workers to the checkpoint-owning consumer.
enum TaskEvent {
    Started {
        id: String,
        at: DateTime<Utc>,
    },
    Finished {
        id: String,
        at: DateTime<Utc>,
        outcome: TaskOutcome,
    },
    NotStarted {
        id: String,
    },
}

/// Statistics from one batch.
#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    /// Tasks handed to the batch
    pub total: usize,

    /// Tasks that completed successfully
    pub completed: usize,

    /// Tasks that failed
    pub failed: usize,

    /// Tasks never dispatched because a pause/stop was requested
    pub not_started: usize,
}

impl std::fmt::Display for BatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Completed: {}, Failed: {}, Not started: {}, Total: {}",
            self.completed, self.failed, self.not_started, self.total
        )
    }
}

/// Executes batches of tasks against a stage handler, recording outcomes in
/// the checkpoint. One runner owns all checkpoint writes for its batch.
pub struct StageRunner {
    store: Arc<CheckpointStore>,
    signal: ControlSignal,
    save_every: usize,
    enable_progress: bool,
    progress_interval_secs: u64,
}

impl StageRunner {
    pub fn new(store: Arc<CheckpointStore>, signal: ControlSignal, config: &ProcessingConfig) -> Self {
        Self {
            store,
            signal,
            save_every: config.save_every,
            enable_progress: config.enable_progress,
            progress_interval_secs: config.progress_interval_secs,
        }
    }

    /// Run a batch of tasks with at most `max_concurrency` in-flight
    /// `process` calls, persisting the checkpoint as outcomes arrive.
    pub async fn run_batch(
        &self,
        checkpoint: &mut Checkpoint,
        tasks: Vec<TaskSpec>,
        handler: Arc<dyn StageHandler>,
        max_concurrency: usize,
    ) -> Result<BatchStats> {
        if tasks.is_empty() {
            return Ok(BatchStats::default());
        }

        let cap = max_concurrency.max(1);
        let total = tasks.len();
        let label = format!("{}/{}", checkpoint.stage_name, checkpoint.period);
        tracing::info!("running {} tasks for {} ({} concurrent)", total, label, cap);

        let progress = BatchProgress::new(total as u64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.enable_progress {
            let reporter = ProgressReporter::new(
                progress.clone(),
                self.progress_interval_secs,
                label.clone(),
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let (tx, mut rx) = mpsc::channel::<TaskEvent>(cap * 2);
        let signal = self.signal.clone();

        let producer = async move {
            let mut in_flight = stream::iter(tasks)
                .map(|task| {
                    let tx = tx.clone();
                    let handler = handler.clone();
                    let signal = signal.clone();
                    async move {
                        let id = task.id();
                        if signal.should_halt() {
                            let _ = tx.send(TaskEvent::NotStarted { id }).await;
                            return;
                        }

                        let _ = tx
                            .send(TaskEvent::Started {
                                id: id.clone(),
                                at: Utc::now(),
                            })
                            .await;

                        // Spawned so a panicking handler becomes a Failed
                        // task instead of unwinding the batch.
                        let outcome = match tokio::spawn({
                            let handler = handler.clone();
                            let task = task.clone();
                            async move { handler.process(&task).await }
                        })
                        .await
                        {
                            Ok(outcome) => outcome,
                            Err(e) => TaskOutcome::failure(
                                ErrorClass::Transient,
                                format!("task panicked: {}", e),
                            ),
                        };

                        let _ = tx
                            .send(TaskEvent::Finished {
                                id,
                                at: Utc::now(),
                                outcome,
                            })
                            .await;
                    }
                })
                .buffer_unordered(cap);

            while in_flight.next().await.is_some() {}
        };

        let consumer = async {
            let mut stats = BatchStats {
                total,
                ..BatchStats::default()
            };
            let mut since_save = 0usize;
            let mut save_error: Option<anyhow::Error> = None;

            while let Some(event) = rx.recv().await {
                match event {
                    TaskEvent::Started { id, at } => {
                        checkpoint.mark_running(&id, at);
                    }
                    TaskEvent::NotStarted { id } => {
                        tracing::debug!("{} not dispatched (halt requested)", id);
                        stats.not_started += 1;
                    }
                    TaskEvent::Finished { id, at, outcome } => {
                        match outcome.error_string() {
                            None => {
                                checkpoint.mark_completed(&id, at);
                                progress.add_completed();
                                stats.completed += 1;
                            }
                            Some(error) => {
                                tracing::warn!("task {} failed: {}", id, error);
                                checkpoint.mark_failed(&id, at, error);
                                progress.add_failed();
                                stats.failed += 1;
                            }
                        }

                        since_save += 1;
                        if save_error.is_none()
                            && self.save_every > 0
                            && since_save >= self.save_every
                        {
                            if let Err(e) = self.store.save(checkpoint) {
                                // Fatal for the batch: halt dispatch, drain
                                // the in-flight tasks, surface the error.
                                self.signal.request_stop();
                                save_error = Some(e);
                            }
                            since_save = 0;
                        }
                    }
                }
            }

            (stats, save_error)
        };

        let ((), (stats, save_error)) = tokio::join!(producer, consumer);

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if let Some(e) = save_error {
            return Err(e.context("checkpoint save failed during batch"));
        }

        self.store
            .save(checkpoint)
            .context("failed to save checkpoint after batch")?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan_tasks;
    use crate::task::{Period, Stage, TaskStatus};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Handler that records call counts and peak concurrency, failing the
    /// cells it is told to fail.
    struct InstrumentedHandler {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_cells: Mutex<HashSet<u32>>,
        delay: Duration,
    }

    impl InstrumentedHandler {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_cells: Mutex::new(HashSet::new()),
                delay,
            })
        }

        fn fail_cell(&self, cell_id: u32) {
            self.fail_cells.lock().unwrap().insert(cell_id);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageHandler for InstrumentedHandler {
        async fn process(&self, task: &TaskSpec) -> TaskOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_cells.lock().unwrap().contains(&task.cell_id) {
                TaskOutcome::failure(ErrorClass::Transient, "injected failure")
            } else {
                TaskOutcome::Success
            }
        }
    }

    fn runner(dir: &TempDir, signal: ControlSignal) -> StageRunner {
        let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
        let config = ProcessingConfig {
            enable_progress: false,
            ..ProcessingConfig::default()
        };
        StageRunner::new(store, signal, &config)
    }

    fn batch(cells: &[u32]) -> (Checkpoint, Vec<TaskSpec>) {
        let planned = plan_tasks(Stage::Persist, Period::Year(2023), cells);
        let cp = Checkpoint::new(Stage::Persist, Period::Year(2023), &planned);
        (cp, planned)
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let dir = TempDir::new().unwrap();
        let run = runner(&dir, ControlSignal::new());
        let cells: Vec<u32> = (1..=100).collect();
        let (mut cp, tasks) = batch(&cells);
        let handler = InstrumentedHandler::new(Duration::from_millis(5));

        let stats = run
            .run_batch(&mut cp, tasks, handler.clone(), 4)
            .await
            .unwrap();

        assert_eq!(stats.completed, 100);
        assert_eq!(handler.calls(), 100);
        assert!(
            handler.max_in_flight() <= 4,
            "observed {} concurrent process calls",
            handler.max_in_flight()
        );
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let dir = TempDir::new().unwrap();
        let run = runner(&dir, ControlSignal::new());
        let (mut cp, tasks) = batch(&[1, 2, 3, 4]);
        let handler = InstrumentedHandler::new(Duration::from_millis(1));
        handler.fail_cell(2);
        handler.fail_cell(3);

        let stats = run.run_batch(&mut cp, tasks, handler, 2).await.unwrap();

        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(cp.status_of("persist_2023_1"), Some(TaskStatus::Completed));
        assert_eq!(cp.status_of("persist_2023_2"), Some(TaskStatus::Failed));
        assert_eq!(
            cp.tasks["persist_2023_2"].error.as_deref(),
            Some("transient: injected failure")
        );
    }

    #[tokio::test]
    async fn test_batch_persists_checkpoint() {
        let dir = TempDir::new().unwrap();
        let signal = ControlSignal::new();
        let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
        let config = ProcessingConfig {
            enable_progress: false,
            ..ProcessingConfig::default()
        };
        let run = StageRunner::new(store.clone(), signal, &config);

        let (mut cp, tasks) = batch(&[1, 2]);
        let handler = InstrumentedHandler::new(Duration::from_millis(1));
        run.run_batch(&mut cp, tasks, handler, 2).await.unwrap();

        let reloaded = store
            .load_existing(Stage::Persist, Period::Year(2023))
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.completed_tasks, 2);
    }

    #[tokio::test]
    async fn test_stop_leaves_undispatched_pending() {
        let dir = TempDir::new().unwrap();
        let signal = ControlSignal::new();
        signal.request_stop();
        let run = runner(&dir, signal);

        let (mut cp, tasks) = batch(&[1, 2, 3]);
        let handler = InstrumentedHandler::new(Duration::from_millis(1));
        let stats = run
            .run_batch(&mut cp, tasks, handler.clone(), 2)
            .await
            .unwrap();

        assert_eq!(stats.not_started, 3);
        assert_eq!(handler.calls(), 0);
        assert!(cp
            .tasks
            .values()
            .all(|task| task.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let run = runner(&dir, ControlSignal::new());
        let (mut cp, _) = batch(&[1]);
        let handler = InstrumentedHandler::new(Duration::ZERO);

        let stats = run
            .run_batch(&mut cp, Vec::new(), handler.clone(), 4)
            .await
            .unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(handler.calls(), 0);
    }
}
