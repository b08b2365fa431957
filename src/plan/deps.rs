//! Dependency resolution for the DeriveChange stage.
//!
//! A cell is eligible for change detection over a period pair only when its
//! Persist task is Completed in both periods. Anything less puts the cell in
//! the skipped set with a reason naming the blocking period. Partial
//! upstream progress is an expected outcome, not an error.

use crate::checkpoint::Checkpoint;
use crate::task::{Stage, TaskSpec, TaskStatus};

/// A cell excluded from a DeriveChange batch, with the reason it is blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCell {
    pub cell_id: u32,
    pub reason: String,
}

/// Result of resolving DeriveChange eligibility over a cell set.
#[derive(Debug, Clone, Default)]
pub struct Eligibility {
    pub ready: Vec<u32>,
    pub skipped: Vec<SkippedCell>,
}

impl Eligibility {
    /// Apply the resolution to a DeriveChange checkpoint.
    ///
    /// Blocked Pending tasks become Skipped; previously Skipped tasks whose
    /// upstream is now satisfied return to Pending. Dependency resolution is
    /// the only path in or out of Skipped. Returns (unskipped, skipped)
    /// counts.
    pub fn apply(&self, checkpoint: &mut Checkpoint) -> (usize, usize) {
        let stage = checkpoint.stage_name;
        let period = checkpoint.period;

        let mut unskipped = 0;
        for &cell_id in &self.ready {
            let id = TaskSpec::new(stage, period, cell_id).id();
            if checkpoint.status_of(&id) == Some(TaskStatus::Skipped) && checkpoint.unskip(&id) {
                unskipped += 1;
            }
        }

        let mut newly_skipped = 0;
        for cell in &self.skipped {
            let id = TaskSpec::new(stage, period, cell.cell_id).id();
            if checkpoint.status_of(&id) == Some(TaskStatus::Pending) && checkpoint.mark_skipped(&id)
            {
                tracing::info!("skipping {}: {}", id, cell.reason);
                newly_skipped += 1;
            }
        }

        (unskipped, newly_skipped)
    }
}

/// Partition cells into ready and skipped for the (persist_a, persist_b)
/// period pair.
pub fn eligible(cell_ids: &[u32], persist_a: &Checkpoint, persist_b: &Checkpoint) -> Eligibility {
    let mut cells: Vec<u32> = cell_ids.to_vec();
    cells.sort_unstable();
    cells.dedup();

    let mut result = Eligibility::default();
    for cell_id in cells {
        match blocking_period(cell_id, persist_a).or_else(|| blocking_period(cell_id, persist_b)) {
            None => result.ready.push(cell_id),
            Some(reason) => result.skipped.push(SkippedCell { cell_id, reason }),
        }
    }
    result
}

/// Reason this cell's Persist task blocks change detection, if it does.
fn blocking_period(cell_id: u32, persist: &Checkpoint) -> Option<String> {
    let id = TaskSpec::new(Stage::Persist, persist.period, cell_id).id();
    match persist.status_of(&id) {
        Some(TaskStatus::Completed) => None,
        Some(status) => Some(format!(
            "persist/{} not completed for cell {} (status: {})",
            persist.period, cell_id, status
        )),
        None => Some(format!(
            "persist/{} has no task for cell {}",
            persist.period, cell_id
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::registry::plan_tasks;
    use crate::task::Period;
    use chrono::Utc;

    fn persist_checkpoint(year: i32, cells: &[u32]) -> Checkpoint {
        let planned = plan_tasks(Stage::Persist, Period::Year(year), cells);
        Checkpoint::new(Stage::Persist, Period::Year(year), &planned)
    }

    fn complete(cp: &mut Checkpoint, cell: u32) {
        let id = TaskSpec::new(Stage::Persist, cp.period, cell).id();
        let now = Utc::now();
        cp.mark_running(&id, now);
        cp.mark_completed(&id, now);
    }

    fn fail(cp: &mut Checkpoint, cell: u32) {
        let id = TaskSpec::new(Stage::Persist, cp.period, cell).id();
        let now = Utc::now();
        cp.mark_running(&id, now);
        cp.mark_failed(&id, now, "transient: network error".to_string());
    }

    #[test]
    fn test_ready_when_both_periods_completed() {
        let mut a = persist_checkpoint(2023, &[1, 2]);
        let mut b = persist_checkpoint(2024, &[1, 2]);
        complete(&mut a, 1);
        complete(&mut a, 2);
        complete(&mut b, 1);
        complete(&mut b, 2);

        let result = eligible(&[1, 2], &a, &b);
        assert_eq!(result.ready, vec![1, 2]);
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn test_failed_later_period_blocks_with_reason() {
        let mut a = persist_checkpoint(2023, &[5]);
        let mut b = persist_checkpoint(2024, &[5]);
        complete(&mut a, 5);
        fail(&mut b, 5);

        let result = eligible(&[5], &a, &b);
        assert!(result.ready.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].cell_id, 5);
        assert!(result.skipped[0].reason.contains("2024"));
        assert!(result.skipped[0].reason.contains("failed"));
    }

    #[test]
    fn test_pending_earlier_period_blocks() {
        let a = persist_checkpoint(2023, &[7]);
        let mut b = persist_checkpoint(2024, &[7]);
        complete(&mut b, 7);

        let result = eligible(&[7], &a, &b);
        assert_eq!(result.skipped.len(), 1);
        assert!(result.skipped[0].reason.contains("2023"));
        assert!(result.skipped[0].reason.contains("pending"));
    }

    #[test]
    fn test_unplanned_cell_blocks() {
        let a = persist_checkpoint(2023, &[]);
        let b = persist_checkpoint(2024, &[]);

        let result = eligible(&[3], &a, &b);
        assert_eq!(result.skipped.len(), 1);
        assert!(result.skipped[0].reason.contains("no task"));
    }

    #[test]
    fn test_apply_marks_and_reverses_skips() {
        let period = Period::Pair(2023, 2024);
        let planned = plan_tasks(Stage::DeriveChange, period, &[1, 2]);
        let mut cp = Checkpoint::new(Stage::DeriveChange, period, &planned);

        // First resolution: cell 2 blocked.
        let first = Eligibility {
            ready: vec![1],
            skipped: vec![SkippedCell {
                cell_id: 2,
                reason: "persist/2024 not completed for cell 2 (status: failed)".to_string(),
            }],
        };
        let (unskipped, skipped) = first.apply(&mut cp);
        assert_eq!((unskipped, skipped), (0, 1));
        assert_eq!(
            cp.status_of("derive_change_2023_2024_2"),
            Some(TaskStatus::Skipped)
        );

        // After a retry upstream, cell 2 becomes ready again.
        let second = Eligibility {
            ready: vec![1, 2],
            skipped: Vec::new(),
        };
        let (unskipped, skipped) = second.apply(&mut cp);
        assert_eq!((unskipped, skipped), (1, 0));
        assert_eq!(
            cp.status_of("derive_change_2023_2024_2"),
            Some(TaskStatus::Pending)
        );
    }

    #[test]
    fn test_apply_never_touches_completed() {
        let period = Period::Pair(2023, 2024);
        let planned = plan_tasks(Stage::DeriveChange, period, &[1]);
        let mut cp = Checkpoint::new(Stage::DeriveChange, period, &planned);
        let now = Utc::now();
        cp.mark_running("derive_change_2023_2024_1", now);
        cp.mark_completed("derive_change_2023_2024_1", now);

        let resolution = Eligibility {
            ready: Vec::new(),
            skipped: vec![SkippedCell {
                cell_id: 1,
                reason: "persist/2024 has no task for cell 1".to_string(),
            }],
        };
        let (_, skipped) = resolution.apply(&mut cp);
        assert_eq!(skipped, 0);
        assert_eq!(
            cp.status_of("derive_change_2023_2024_1"),
            Some(TaskStatus::Completed)
        );
    }
}
