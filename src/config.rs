//! Configuration for the change-detection pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::task::Stage;

/// Main configuration, passed immutably into the controller at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Spatial and temporal coverage
    #[serde(default)]
    pub coverage: CoverageConfig,

    /// Data layout and processing mode
    #[serde(default)]
    pub storage: StorageConfig,

    /// Concurrency and checkpointing behavior
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// External collaborator command templates
    #[serde(default)]
    pub commands: CommandsConfig,
}

/// Which cells and years the pipeline covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageConfig {
    /// Grid cell ids to process
    #[serde(default = "default_cell_ids")]
    pub cell_ids: Vec<u32>,

    /// Years to process, strictly ascending.
    /// Change masks are derived for each consecutive pair.
    #[serde(default = "default_years")]
    pub years: Vec<i32>,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            cell_ids: default_cell_ids(),
            years: default_years(),
        }
    }
}

/// Where imagery, masks and checkpoints live, and which persistence
/// backends are active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base data directory; all other paths derive from it
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Persistence mode: local filesystem, database, or both
    #[serde(default)]
    pub mode: ProcessingMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mode: ProcessingMode::default(),
        }
    }
}

impl StorageConfig {
    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn masks_dir(&self) -> PathBuf {
        self.data_dir.join("masks")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}

/// Persistence mode selecting the active persist adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    LocalOnly,
    DatabaseOnly,
    Hybrid,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingMode::LocalOnly => "local_only",
            ProcessingMode::DatabaseOnly => "database_only",
            ProcessingMode::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// Concurrency and checkpointing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Concurrent acquire tasks (bounded by the download client's rate limit)
    #[serde(default = "default_io_concurrency")]
    pub acquire_concurrency: usize,

    /// Concurrent persist tasks
    #[serde(default = "default_io_concurrency")]
    pub persist_concurrency: usize,

    /// Concurrent change-inference tasks.
    /// The model is GPU-bound; keep this at 1 unless memory allows more.
    #[serde(default = "default_derive_concurrency")]
    pub derive_concurrency: usize,

    /// Persist the checkpoint after every N task completions.
    /// 0 saves only at batch end.
    #[serde(default = "default_save_every")]
    pub save_every: usize,

    /// Resume from existing checkpoints; false recreates them all Pending
    #[serde(default = "default_true")]
    pub resume: bool,

    /// Enable periodic progress reporting during batches
    #[serde(default = "default_true")]
    pub enable_progress: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            acquire_concurrency: default_io_concurrency(),
            persist_concurrency: default_io_concurrency(),
            derive_concurrency: default_derive_concurrency(),
            save_every: default_save_every(),
            resume: true,
            enable_progress: true,
            progress_interval_secs: default_progress_interval(),
            worker_threads: None,
        }
    }
}

impl ProcessingConfig {
    /// Concurrency bound for a stage's batches.
    pub fn concurrency_for(&self, stage: Stage) -> usize {
        match stage {
            Stage::Acquire => self.acquire_concurrency,
            Stage::Persist => self.persist_concurrency,
            Stage::DeriveChange => self.derive_concurrency,
        }
    }
}

/// Command templates for the external collaborators.
///
/// Placeholders: acquire gets `{cell}`, `{year}`, `{output}`; insert gets
/// `{input}`, `{cell}`, `{year}`; derive_change gets `{before}`, `{after}`,
/// `{output}`, `{cell}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Download client invocation
    #[serde(default)]
    pub acquire: Option<String>,

    /// Database insert client invocation (database/hybrid modes)
    #[serde(default)]
    pub insert: Option<String>,

    /// Change-inference model invocation
    #[serde(default)]
    pub derive_change: Option<String>,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.coverage.cell_ids.is_empty() {
            anyhow::bail!("At least one cell id must be configured");
        }
        if self.coverage.years.is_empty() {
            anyhow::bail!("At least one year must be configured");
        }
        if self
            .coverage
            .years
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            anyhow::bail!("Years must be strictly ascending");
        }
        if self.processing.acquire_concurrency == 0
            || self.processing.persist_concurrency == 0
            || self.processing.derive_concurrency == 0
        {
            anyhow::bail!("Concurrency must be > 0 for every stage");
        }
        if matches!(
            self.storage.mode,
            ProcessingMode::DatabaseOnly | ProcessingMode::Hybrid
        ) && self.commands.insert.is_none()
        {
            anyhow::bail!(
                "Mode {} requires an insert command for the database client",
                self.storage.mode
            );
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_cell_ids() -> Vec<u32> {
    vec![465, 466, 467]
}
fn default_years() -> Vec<i32> {
    (2020..=2024).collect()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_io_concurrency() -> usize {
    4
}
fn default_derive_concurrency() -> usize {
    1
}
fn default_save_every() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_progress_interval() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.coverage.years, vec![2020, 2021, 2022, 2023, 2024]);
        assert_eq!(config.processing.derive_concurrency, 1);
        assert_eq!(config.processing.save_every, 1);
        assert!(config.processing.resume);
        assert_eq!(config.storage.mode, ProcessingMode::LocalOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_paths() {
        let config = Config::default();
        assert_eq!(config.storage.images_dir(), PathBuf::from("data/images"));
        assert_eq!(
            config.storage.checkpoints_dir(),
            PathBuf::from("data/checkpoints")
        );
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = Config::from_yaml(
            r#"
coverage:
  cell_ids: [1, 2]
  years: [2023, 2024]
processing:
  derive_concurrency: 2
"#,
        )
        .unwrap();

        assert_eq!(config.coverage.cell_ids, vec![1, 2]);
        assert_eq!(config.processing.derive_concurrency, 2);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.processing.acquire_concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_unsorted_years() {
        let mut config = Config::default();
        config.coverage.years = vec![2024, 2023];
        assert!(config.validate().is_err());

        config.coverage.years = vec![2023, 2023];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_coverage() {
        let mut config = Config::default();
        config.coverage.cell_ids.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.coverage.years.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_database_mode_needs_insert_command() {
        let mut config = Config::default();
        config.storage.mode = ProcessingMode::DatabaseOnly;
        assert!(config.validate().is_err());

        config.commands.insert = Some("eo-insert {input}".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_concurrency_for_stage() {
        let config = ProcessingConfig::default();
        assert_eq!(config.concurrency_for(Stage::Acquire), 4);
        assert_eq!(config.concurrency_for(Stage::DeriveChange), 1);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.coverage.years, config.coverage.years);
        assert_eq!(parsed.storage.mode, config.storage.mode);
    }
}
