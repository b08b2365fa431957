//! The checkpoint aggregate: per-task records and derived counters for one
//! (stage, period).
//!
//! Status transitions are monotonic: Pending -> Running -> Completed/Failed.
//! Failed goes back to Pending only through the explicit retry operation, and
//! Skipped is entered and left only through dependency resolution. Counters
//! are kept in sync on every mutation and must always be recomputable from
//! the task map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Period, Stage, TaskSpec, TaskStatus};

/// Persisted record of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Diagnostic message, present only when the task is Failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Durable completion state for all tasks of one (stage, period).
///
/// Field names match the checkpoint wire format consumed by the external
/// monitoring dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage_name: Stage,
    pub period: Period,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub tasks: BTreeMap<String, TaskRecord>,
}

impl Checkpoint {
    /// Create a fresh checkpoint with every planned task Pending.
    pub fn new(stage: Stage, period: Period, planned: &[TaskSpec]) -> Self {
        let tasks: BTreeMap<String, TaskRecord> = planned
            .iter()
            .map(|task| (task.id(), TaskRecord::pending()))
            .collect();

        Self {
            stage_name: stage,
            period,
            total_tasks: tasks.len(),
            completed_tasks: 0,
            failed_tasks: 0,
            skipped_tasks: 0,
            tasks,
        }
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|task| task.status)
    }

    /// A checkpoint is complete when no task remains eligible for dispatch.
    /// Failed tasks do not block completion; they wait for an explicit retry.
    pub fn is_complete(&self) -> bool {
        self.completed_tasks + self.skipped_tasks == self.total_tasks
    }

    pub fn percent(&self) -> f64 {
        if self.total_tasks == 0 {
            return 100.0;
        }
        (self.completed_tasks + self.skipped_tasks) as f64 / self.total_tasks as f64 * 100.0
    }

    /// Recompute all counters from the task map, healing any drift found in
    /// a persisted file. Returns true if a counter had drifted.
    pub fn recount(&mut self) -> bool {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Skipped => skipped += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }

        let drifted = self.total_tasks != self.tasks.len()
            || self.completed_tasks != completed
            || self.failed_tasks != failed
            || self.skipped_tasks != skipped;

        self.total_tasks = self.tasks.len();
        self.completed_tasks = completed;
        self.failed_tasks = failed;
        self.skipped_tasks = skipped;
        drifted
    }

    /// Add planned tasks that are missing from the map as Pending.
    ///
    /// Stale records for cells no longer planned are left untouched; they are
    /// simply never replanned. Returns the number of tasks added.
    pub fn ensure_tasks(&mut self, planned: &[TaskSpec]) -> usize {
        let mut added = 0;
        for task in planned {
            let id = task.id();
            if !self.tasks.contains_key(&id) {
                self.tasks.insert(id, TaskRecord::pending());
                added += 1;
            }
        }
        self.total_tasks = self.tasks.len();
        added
    }

    /// Reset any Running task to Pending.
    ///
    /// A task persisted as Running means the previous process died
    /// mid-execution; completion cannot be confirmed, so the task must be
    /// re-run. Returns the number of recovered tasks.
    pub fn recover_in_flight(&mut self) -> usize {
        let mut recovered = 0;
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                recovered += 1;
            }
        }
        recovered
    }

    /// Transition all Failed tasks back to Pending (the explicit retry
    /// operation). Completed and Skipped tasks are untouched. Returns the
    /// number of tasks reset.
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Failed {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.completed_at = None;
                task.error = None;
                reset += 1;
            }
        }
        self.failed_tasks = 0;
        reset
    }

    pub fn mark_running(&mut self, task_id: &str, at: DateTime<Utc>) -> bool {
        match self.transition(task_id, TaskStatus::Running) {
            Some(task) => {
                task.started_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn mark_completed(&mut self, task_id: &str, at: DateTime<Utc>) -> bool {
        match self.transition(task_id, TaskStatus::Completed) {
            Some(task) => {
                task.completed_at = Some(at);
                task.error = None;
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, task_id: &str, at: DateTime<Utc>, error: String) -> bool {
        match self.transition(task_id, TaskStatus::Failed) {
            Some(task) => {
                task.completed_at = Some(at);
                task.error = Some(error);
                true
            }
            None => false,
        }
    }

    /// Mark a Pending task Skipped (dependency resolution only).
    pub fn mark_skipped(&mut self, task_id: &str) -> bool {
        match self.transition(task_id, TaskStatus::Skipped) {
            Some(task) => {
                task.completed_at = Some(Utc::now());
                task.error = None;
                true
            }
            None => false,
        }
    }

    /// Return a Skipped task to Pending (dependency resolution only).
    pub fn unskip(&mut self, task_id: &str) -> bool {
        match self.transition(task_id, TaskStatus::Pending) {
            Some(task) => {
                task.started_at = None;
                task.completed_at = None;
                task.error = None;
                true
            }
            None => false,
        }
    }

    fn transition(&mut self, task_id: &str, to: TaskStatus) -> Option<&mut TaskRecord> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            tracing::warn!(
                "task {} not present in {}/{} checkpoint",
                task_id,
                self.stage_name,
                self.period
            );
            return None;
        };

        let from = task.status;
        if !transition_allowed(from, to) {
            tracing::warn!(
                "ignoring invalid transition {} -> {} for task {}",
                from,
                to,
                task_id
            );
            return None;
        }

        match from {
            TaskStatus::Completed => self.completed_tasks -= 1,
            TaskStatus::Failed => self.failed_tasks -= 1,
            TaskStatus::Skipped => self.skipped_tasks -= 1,
            TaskStatus::Pending | TaskStatus::Running => {}
        }
        match to {
            TaskStatus::Completed => self.completed_tasks += 1,
            TaskStatus::Failed => self.failed_tasks += 1,
            TaskStatus::Skipped => self.skipped_tasks += 1,
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        task.status = to;
        Some(task)
    }
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Pending)
            | (Failed, Pending)
            | (Pending, Skipped)
            | (Skipped, Pending)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Period, Stage};

    fn planned(count: u32) -> Vec<TaskSpec> {
        (1..=count)
            .map(|cell| TaskSpec::new(Stage::Persist, Period::Year(2023), cell))
            .collect()
    }

    fn checkpoint(count: u32) -> Checkpoint {
        Checkpoint::new(Stage::Persist, Period::Year(2023), &planned(count))
    }

    #[test]
    fn test_new_checkpoint_all_pending() {
        let cp = checkpoint(3);
        assert_eq!(cp.total_tasks, 3);
        assert_eq!(cp.completed_tasks, 0);
        assert_eq!(cp.failed_tasks, 0);
        assert_eq!(cp.skipped_tasks, 0);
        assert!(cp
            .tasks
            .values()
            .all(|task| task.status == TaskStatus::Pending));
    }

    #[test]
    fn test_lifecycle_updates_counters() {
        let mut cp = checkpoint(2);
        let now = Utc::now();

        assert!(cp.mark_running("persist_2023_1", now));
        assert!(cp.mark_completed("persist_2023_1", now));
        assert!(cp.mark_running("persist_2023_2", now));
        assert!(cp.mark_failed("persist_2023_2", now, "transient: timeout".to_string()));

        assert_eq!(cp.completed_tasks, 1);
        assert_eq!(cp.failed_tasks, 1);
        assert!(!cp.recount(), "counters should already be consistent");

        let failed = &cp.tasks["persist_2023_2"];
        assert_eq!(failed.error.as_deref(), Some("transient: timeout"));
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn test_invalid_transitions_ignored() {
        let mut cp = checkpoint(1);
        let now = Utc::now();

        // Completed tasks never regress.
        cp.mark_running("persist_2023_1", now);
        cp.mark_completed("persist_2023_1", now);
        assert!(!cp.mark_running("persist_2023_1", now));
        assert!(!cp.mark_failed("persist_2023_1", now, "x".to_string()));
        assert_eq!(cp.completed_tasks, 1);

        // Unknown task ids are rejected.
        assert!(!cp.mark_running("persist_2023_99", now));
    }

    #[test]
    fn test_reset_failed_scoped_to_failed_tasks() {
        let mut cp = checkpoint(6);
        let now = Utc::now();
        for cell in 1..=3 {
            let id = format!("persist_2023_{}", cell);
            cp.mark_running(&id, now);
            cp.mark_completed(&id, now);
        }
        for cell in 4..=5 {
            let id = format!("persist_2023_{}", cell);
            cp.mark_running(&id, now);
            cp.mark_failed(&id, now, "transient: timeout".to_string());
        }
        cp.mark_skipped("persist_2023_6");

        let reset = cp.reset_failed();
        assert_eq!(reset, 2);
        assert_eq!(cp.completed_tasks, 3);
        assert_eq!(cp.failed_tasks, 0);
        assert_eq!(cp.skipped_tasks, 1);
        assert_eq!(cp.status_of("persist_2023_4"), Some(TaskStatus::Pending));
        assert_eq!(cp.status_of("persist_2023_1"), Some(TaskStatus::Completed));
        assert_eq!(cp.status_of("persist_2023_6"), Some(TaskStatus::Skipped));
        assert!(cp.tasks["persist_2023_4"].error.is_none());
    }

    #[test]
    fn test_recover_in_flight() {
        let mut cp = checkpoint(2);
        let now = Utc::now();
        cp.mark_running("persist_2023_1", now);

        let recovered = cp.recover_in_flight();
        assert_eq!(recovered, 1);
        assert_eq!(cp.status_of("persist_2023_1"), Some(TaskStatus::Pending));
        assert!(cp.tasks["persist_2023_1"].started_at.is_none());
    }

    #[test]
    fn test_ensure_tasks_adds_new_keeps_stale() {
        let mut cp = checkpoint(2);
        let now = Utc::now();
        cp.mark_running("persist_2023_1", now);
        cp.mark_completed("persist_2023_1", now);

        // Operator changed the cell list: cell 2 removed, cell 3 added.
        let replanned = vec![
            TaskSpec::new(Stage::Persist, Period::Year(2023), 1),
            TaskSpec::new(Stage::Persist, Period::Year(2023), 3),
        ];
        let added = cp.ensure_tasks(&replanned);

        assert_eq!(added, 1);
        assert_eq!(cp.total_tasks, 3);
        assert_eq!(cp.status_of("persist_2023_2"), Some(TaskStatus::Pending));
        assert_eq!(cp.status_of("persist_2023_3"), Some(TaskStatus::Pending));
        assert_eq!(cp.status_of("persist_2023_1"), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_recount_heals_drift() {
        let mut cp = checkpoint(2);
        let now = Utc::now();
        cp.mark_running("persist_2023_1", now);
        cp.mark_completed("persist_2023_1", now);

        // Simulate a hand-edited file with broken counters.
        cp.completed_tasks = 0;
        cp.total_tasks = 99;

        assert!(cp.recount());
        assert_eq!(cp.total_tasks, 2);
        assert_eq!(cp.completed_tasks, 1);
    }

    #[test]
    fn test_skip_and_unskip() {
        let mut cp = checkpoint(1);
        assert!(cp.mark_skipped("persist_2023_1"));
        assert_eq!(cp.skipped_tasks, 1);
        assert!(cp.is_complete());

        assert!(cp.unskip("persist_2023_1"));
        assert_eq!(cp.skipped_tasks, 0);
        assert_eq!(cp.status_of("persist_2023_1"), Some(TaskStatus::Pending));
        assert!(!cp.is_complete());
    }

    #[test]
    fn test_percent() {
        let mut cp = checkpoint(4);
        let now = Utc::now();
        cp.mark_running("persist_2023_1", now);
        cp.mark_completed("persist_2023_1", now);
        cp.mark_skipped("persist_2023_2");
        assert!((cp.percent() - 50.0).abs() < f64::EPSILON);

        let empty = Checkpoint::new(Stage::Persist, Period::Year(2023), &[]);
        assert!((empty.percent() - 100.0).abs() < f64::EPSILON);
    }
}
