//! Core task identity types shared by planning, execution and checkpoints.
//!
//! A task is identified by the tuple (stage, period, cell id). Acquire and
//! Persist operate on a single year; DeriveChange operates on an ordered
//! pair of consecutive years.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Processing stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetch imagery for a (cell, year) from the external download client.
    Acquire,

    /// Persist acquired imagery into the configured store.
    Persist,

    /// Derive a change mask from two consecutive years of persisted imagery.
    DeriveChange,
}

impl Stage {
    /// Stable lowercase name used in task ids and checkpoint file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Persist => "persist",
            Stage::DeriveChange => "derive_change",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acquire" => Ok(Stage::Acquire),
            "persist" => Ok(Stage::Persist),
            "derive_change" => Ok(Stage::DeriveChange),
            other => bail!("unknown stage: {}", other),
        }
    }
}

/// Time bucket a stage operates on.
///
/// Serialized as a string: `"2023"` for a single year, `"2023_2024"` for a
/// change-detection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Year(i32),
    Pair(i32, i32),
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Year(year) => write!(f, "{}", year),
            Period::Pair(earlier, later) => write!(f, "{}_{}", earlier, later),
        }
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('_') {
            Some((earlier, later)) => {
                let earlier: i32 = earlier.parse()?;
                let later: i32 = later.parse()?;
                if earlier >= later {
                    bail!("period pair must be ordered: {}", s);
                }
                Ok(Period::Pair(earlier, later))
            }
            None => Ok(Period::Year(s.parse()?)),
        }
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Execution status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Whether the task needs no further scheduling.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Identity of one unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskSpec {
    pub stage: Stage,
    pub period: Period,
    pub cell_id: u32,
}

impl TaskSpec {
    pub fn new(stage: Stage, period: Period, cell_id: u32) -> Self {
        Self {
            stage,
            period,
            cell_id,
        }
    }

    /// Task id string, unique within a checkpoint: `"{stage}_{period}_{cell}"`.
    pub fn id(&self) -> String {
        format!("{}_{}_{}", self.stage, self.period, self.cell_id)
    }
}

impl fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}
