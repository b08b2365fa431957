//! Filesystem-backed stage adapters.
//!
//! The local data layout mirrors the store the web application browses:
//!
//! ```text
//! data/
//!   images/{year}/cell_{id}.tif          downloaded imagery (acquire)
//!   store/{year}/cell_{id}.tif + .json   persisted imagery + metadata sidecar
//!   masks/{a}_{b}/cell_{id}_mask.tif     derived change masks
//! ```
//!
//! Every adapter short-circuits on an already-present output, so re-running
//! a recovered task is a safe no-op.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use crate::config::{Config, ProcessingMode};
use crate::task::{Period, TaskSpec};

use super::{command, ErrorClass, StageHandler, TaskOutcome};

fn image_path(images_dir: &Path, year: i32, cell_id: u32) -> PathBuf {
    images_dir
        .join(year.to_string())
        .join(format!("cell_{}.tif", cell_id))
}

fn store_image_path(store_dir: &Path, year: i32, cell_id: u32) -> PathBuf {
    store_dir
        .join(year.to_string())
        .join(format!("cell_{}.tif", cell_id))
}

fn mask_path(masks_dir: &Path, earlier: i32, later: i32, cell_id: u32) -> PathBuf {
    masks_dir
        .join(format!("{}_{}", earlier, later))
        .join(format!("cell_{}_mask.tif", cell_id))
}

fn year_of(task: &TaskSpec) -> Result<i32, TaskOutcome> {
    match task.period {
        Period::Year(year) => Ok(year),
        Period::Pair(..) => Err(TaskOutcome::failure(
            ErrorClass::Validation,
            format!("{} dispatched with a period pair", task.id()),
        )),
    }
}

fn ensure_parent(path: &Path) -> Result<(), TaskOutcome> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TaskOutcome::failure(
                ErrorClass::Transient,
                format!("failed to create {}: {}", parent.display(), e),
            )
        })?;
    }
    Ok(())
}

/// Acquire adapter: fetch imagery for a (cell, year) via the external
/// download command.
pub struct AcquireHandler {
    images_dir: PathBuf,
    command: Option<String>,
}

impl AcquireHandler {
    pub fn from_config(config: &Config) -> Self {
        Self {
            images_dir: config.storage.images_dir(),
            command: config.commands.acquire.clone(),
        }
    }
}

#[async_trait]
impl StageHandler for AcquireHandler {
    async fn process(&self, task: &TaskSpec) -> TaskOutcome {
        let year = match year_of(task) {
            Ok(year) => year,
            Err(outcome) => return outcome,
        };
        let output = image_path(&self.images_dir, year, task.cell_id);

        if output.exists() {
            tracing::debug!("{} already acquired: {}", task.id(), output.display());
            return TaskOutcome::Success;
        }

        let Some(template) = &self.command else {
            return TaskOutcome::failure(
                ErrorClass::Validation,
                format!(
                    "image {} missing and no acquire command configured",
                    output.display()
                ),
            );
        };

        if let Err(outcome) = ensure_parent(&output) {
            return outcome;
        }

        let rendered = command::render(
            template,
            &[
                ("cell", task.cell_id.to_string()),
                ("year", year.to_string()),
                ("output", output.display().to_string()),
            ],
        );
        match command::invoke(&rendered).await {
            TaskOutcome::Success if output.exists() => TaskOutcome::Success,
            TaskOutcome::Success => TaskOutcome::failure(
                ErrorClass::Transient,
                format!(
                    "acquire command succeeded but {} was not produced",
                    output.display()
                ),
            ),
            failure => failure,
        }
    }
}

/// Persist adapter: move acquired imagery into the store layout and/or hand
/// it to the external database insert client, depending on the processing
/// mode.
pub struct PersistHandler {
    images_dir: PathBuf,
    store_dir: PathBuf,
    mode: ProcessingMode,
    insert_command: Option<String>,
}

impl PersistHandler {
    pub fn from_config(config: &Config) -> Self {
        Self {
            images_dir: config.storage.images_dir(),
            store_dir: config.storage.store_dir(),
            mode: config.storage.mode,
            insert_command: config.commands.insert.clone(),
        }
    }

    fn persist_locally(&self, task: &TaskSpec, year: i32, source: &Path) -> TaskOutcome {
        let dest = store_image_path(&self.store_dir, year, task.cell_id);
        let source_len = match fs::metadata(source) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return TaskOutcome::failure(
                    ErrorClass::Transient,
                    format!("failed to stat {}: {}", source.display(), e),
                )
            }
        };

        // Already persisted with the same content length: safe no-op.
        if let Ok(meta) = fs::metadata(&dest) {
            if meta.len() == source_len {
                tracing::debug!("{} already persisted: {}", task.id(), dest.display());
                return TaskOutcome::Success;
            }
        }

        if let Err(outcome) = ensure_parent(&dest) {
            return outcome;
        }
        if let Err(e) = fs::copy(source, &dest) {
            return TaskOutcome::failure(
                ErrorClass::Transient,
                format!(
                    "failed to copy {} -> {}: {}",
                    source.display(),
                    dest.display(),
                    e
                ),
            );
        }

        let metadata = serde_json::json!({
            "cell_id": task.cell_id,
            "year": year,
            "bytes": source_len,
            "persisted_at": Utc::now().to_rfc3339(),
        });
        let sidecar = dest.with_extension("json");
        if let Err(e) = fs::write(&sidecar, metadata.to_string()) {
            return TaskOutcome::failure(
                ErrorClass::Transient,
                format!("failed to write {}: {}", sidecar.display(), e),
            );
        }

        TaskOutcome::Success
    }

    async fn persist_to_database(&self, task: &TaskSpec, year: i32, source: &Path) -> TaskOutcome {
        let Some(template) = &self.insert_command else {
            return TaskOutcome::failure(
                ErrorClass::Validation,
                "no insert command configured for database persistence",
            );
        };

        let rendered = command::render(
            template,
            &[
                ("input", source.display().to_string()),
                ("cell", task.cell_id.to_string()),
                ("year", year.to_string()),
            ],
        );
        command::invoke(&rendered).await
    }
}

#[async_trait]
impl StageHandler for PersistHandler {
    async fn process(&self, task: &TaskSpec) -> TaskOutcome {
        let year = match year_of(task) {
            Ok(year) => year,
            Err(outcome) => return outcome,
        };
        let source = image_path(&self.images_dir, year, task.cell_id);
        if !source.exists() {
            return TaskOutcome::failure(
                ErrorClass::Validation,
                format!("acquired image {} not found", source.display()),
            );
        }

        if matches!(
            self.mode,
            ProcessingMode::LocalOnly | ProcessingMode::Hybrid
        ) {
            let outcome = self.persist_locally(task, year, &source);
            if !outcome.is_success() {
                return outcome;
            }
        }

        if matches!(
            self.mode,
            ProcessingMode::DatabaseOnly | ProcessingMode::Hybrid
        ) {
            let outcome = self.persist_to_database(task, year, &source).await;
            if !outcome.is_success() {
                return outcome;
            }
        }

        TaskOutcome::Success
    }
}

/// DeriveChange adapter: run the external change-inference command over both
/// persisted periods of a cell.
pub struct DeriveChangeHandler {
    store_dir: PathBuf,
    masks_dir: PathBuf,
    command: Option<String>,
}

impl DeriveChangeHandler {
    pub fn from_config(config: &Config) -> Self {
        Self {
            store_dir: config.storage.store_dir(),
            masks_dir: config.storage.masks_dir(),
            command: config.commands.derive_change.clone(),
        }
    }
}

#[async_trait]
impl StageHandler for DeriveChangeHandler {
    async fn process(&self, task: &TaskSpec) -> TaskOutcome {
        let (earlier, later) = match task.period {
            Period::Pair(earlier, later) => (earlier, later),
            Period::Year(_) => {
                return TaskOutcome::failure(
                    ErrorClass::Validation,
                    format!("{} dispatched with a single-year period", task.id()),
                )
            }
        };

        let before = store_image_path(&self.store_dir, earlier, task.cell_id);
        let after = store_image_path(&self.store_dir, later, task.cell_id);
        for input in [&before, &after] {
            if !input.exists() {
                // The dependency resolver gates on persist completion, so a
                // missing input means the store was modified out-of-band.
                return TaskOutcome::failure(
                    ErrorClass::Validation,
                    format!("persisted image {} missing", input.display()),
                );
            }
        }

        let output = mask_path(&self.masks_dir, earlier, later, task.cell_id);
        if output.exists() {
            tracing::debug!("{} already derived: {}", task.id(), output.display());
            return TaskOutcome::Success;
        }

        let Some(template) = &self.command else {
            return TaskOutcome::failure(
                ErrorClass::Validation,
                "no change-inference command configured",
            );
        };

        if let Err(outcome) = ensure_parent(&output) {
            return outcome;
        }

        let rendered = command::render(
            template,
            &[
                ("before", before.display().to_string()),
                ("after", after.display().to_string()),
                ("output", output.display().to_string()),
                ("cell", task.cell_id.to_string()),
            ],
        );
        match command::invoke(&rendered).await {
            TaskOutcome::Success if output.exists() => TaskOutcome::Success,
            TaskOutcome::Success => TaskOutcome::failure(
                ErrorClass::Transient,
                format!(
                    "inference command succeeded but {} was not produced",
                    output.display()
                ),
            ),
            failure => failure,
        }
    }
}
