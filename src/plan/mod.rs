//! Work planning: task enumeration, remaining-set computation and
//! DeriveChange dependency resolution.

pub mod deps;
pub mod registry;

pub use deps::{eligible, Eligibility, SkippedCell};
pub use registry::{plan_tasks, remaining_tasks, PlanGroup, RunPlan};
