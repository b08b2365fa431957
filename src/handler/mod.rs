//! The stage handler boundary.
//!
//! Each processing stage wraps an external collaborator (download client,
//! storage writer, inference model) behind a single capability:
//! `process(task)`. Failures never cross the boundary as panics or errors;
//! they are data, carried back as a classified `TaskOutcome` so the run can
//! continue around them.

mod command;
mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::task::{Stage, TaskSpec};

pub use command::{classify_failure, invoke, render};
pub use local::{AcquireHandler, DeriveChangeHandler, PersistHandler};

/// Classification of a task failure, used to steer the operator response:
/// transient failures are retried as-is, validation failures need
/// intervention, resource failures suggest lowering concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Validation,
    Resource,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Resource => "resource",
        };
        f.write_str(s)
    }
}

/// Result of processing a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure { class: ErrorClass, message: String },
}

impl TaskOutcome {
    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            class,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }

    /// Error string persisted in the checkpoint: `"{class}: {message}"`.
    pub fn error_string(&self) -> Option<String> {
        match self {
            TaskOutcome::Success => None,
            TaskOutcome::Failure { class, message } => Some(format!("{}: {}", class, message)),
        }
    }
}

/// Uniform interface over the three external processing stages.
///
/// Implementations must be idempotent: a task interrupted mid-run is
/// re-dispatched after recovery, so re-processing already-completed work has
/// to be a safe no-op.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn process(&self, task: &TaskSpec) -> TaskOutcome;
}

/// The active handler per stage, chosen once at controller construction.
#[derive(Clone)]
pub struct HandlerSet {
    acquire: Arc<dyn StageHandler>,
    persist: Arc<dyn StageHandler>,
    derive_change: Arc<dyn StageHandler>,
}

impl HandlerSet {
    pub fn new(
        acquire: Arc<dyn StageHandler>,
        persist: Arc<dyn StageHandler>,
        derive_change: Arc<dyn StageHandler>,
    ) -> Self {
        Self {
            acquire,
            persist,
            derive_change,
        }
    }

    /// Build the handler set for the configured processing mode.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(AcquireHandler::from_config(config)),
            Arc::new(PersistHandler::from_config(config)),
            Arc::new(DeriveChangeHandler::from_config(config)),
        )
    }

    pub fn for_stage(&self, stage: Stage) -> Arc<dyn StageHandler> {
        match stage {
            Stage::Acquire => self.acquire.clone(),
            Stage::Persist => self.persist.clone(),
            Stage::DeriveChange => self.derive_change.clone(),
        }
    }
}
