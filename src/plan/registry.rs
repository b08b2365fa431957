//! Task planning: the full work set for a (stage, period) and the remaining
//! set given checkpoint state.

use anyhow::{bail, Result};

use crate::checkpoint::Checkpoint;
use crate::task::{Period, Stage, TaskSpec, TaskStatus};

/// Build the full task set for a stage/period over the given cells.
///
/// Deterministic: cells are sorted ascending and deduplicated so repeated
/// planning over the same configuration is reproducible.
pub fn plan_tasks(stage: Stage, period: Period, cell_ids: &[u32]) -> Vec<TaskSpec> {
    let mut cells: Vec<u32> = cell_ids.to_vec();
    cells.sort_unstable();
    cells.dedup();

    cells
        .into_iter()
        .map(|cell_id| TaskSpec::new(stage, period, cell_id))
        .collect()
}

/// Filter the planned set down to the tasks still eligible for dispatch.
///
/// Completed and Skipped tasks are excluded. Failed tasks are also excluded:
/// a normal run never silently retries a failure, only the explicit retry
/// operation resets Failed back to Pending.
pub fn remaining_tasks(checkpoint: &Checkpoint, planned: &[TaskSpec]) -> Vec<TaskSpec> {
    planned
        .iter()
        .filter(|task| {
            matches!(
                checkpoint.status_of(&task.id()),
                Some(TaskStatus::Pending) | Some(TaskStatus::Running) | None
            )
        })
        .cloned()
        .collect()
}

/// One (stage, period) group of the run plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanGroup {
    pub stage: Stage,
    pub period: Period,
}

/// The ordered (stage, period) sequence for a single invocation.
///
/// For each year ascending: Acquire then Persist; once a year and its
/// predecessor both have a Persist group scheduled, the DeriveChange group
/// for the pair follows. Ephemeral: derived from configuration, never
/// persisted.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub groups: Vec<PlanGroup>,
}

impl RunPlan {
    pub fn build(cell_ids: &[u32], years: &[i32]) -> Result<Self> {
        if cell_ids.is_empty() {
            bail!("cannot plan a run without cells");
        }
        if years.is_empty() {
            bail!("cannot plan a run without years");
        }
        if years.windows(2).any(|pair| pair[0] >= pair[1]) {
            bail!("years must be strictly ascending: {:?}", years);
        }

        let mut groups = Vec::with_capacity(years.len() * 3);
        for (idx, &year) in years.iter().enumerate() {
            groups.push(PlanGroup {
                stage: Stage::Acquire,
                period: Period::Year(year),
            });
            groups.push(PlanGroup {
                stage: Stage::Persist,
                period: Period::Year(year),
            });
            if idx > 0 {
                groups.push(PlanGroup {
                    stage: Stage::DeriveChange,
                    period: Period::Pair(years[idx - 1], year),
                });
            }
        }

        Ok(Self { groups })
    }
}
