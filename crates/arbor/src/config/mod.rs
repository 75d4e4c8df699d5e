//! Configuration for Arbor
//!
//! Loaded from TOML. Every section and field is optional and falls back to
//! the defaults below; [`Config::validate`] rejects values the engine cannot
//! run with.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::consolidation::ConsolidatorConfig;
use crate::crypto::{KdfParams, MIN_KDF_ITERATIONS};
use crate::error::{ArborError, Result};
use crate::memory::score::ScoreConfig;
use crate::memory::types::Category;
use crate::storage::archive::ArchiveOptions;
use crate::storage::buffer::BufferPolicy;
use crate::storage::categorized::{CategoryPolicy, StoreOptions};

/// Main configuration structure for Arbor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// On-disk layout and I/O behaviour
    #[serde(default)]
    pub storage: StorageConfig,
    /// Hot buffer limits
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Per-category capacity and retention overrides
    #[serde(default)]
    pub categories: CategoriesConfig,
    /// Score weights and saturation points
    #[serde(default)]
    pub scoring: ScoreConfig,
    /// Archive encryption settings
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Consolidation job settings
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for the store and archive
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Pause before retrying a transient I/O failure, in milliseconds
    #[serde(default = "default_io_retry_backoff_ms")]
    pub io_retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            io_retry_backoff_ms: default_io_retry_backoff_ms(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".arbor"))
        .unwrap_or_else(|| PathBuf::from(".arbor"))
}

fn default_io_retry_backoff_ms() -> u64 {
    50
}

/// Hot buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum buffered entries
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    /// Hours before a buffered entry is due to move to the store
    #[serde(default = "default_buffer_retention_hours")]
    pub retention_hours: i64,
    /// Seconds a never-read entry is protected from eviction
    #[serde(default = "default_write_guard_secs")]
    pub write_guard_secs: i64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            retention_hours: default_buffer_retention_hours(),
            write_guard_secs: default_write_guard_secs(),
        }
    }
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_buffer_retention_hours() -> i64 {
    24
}

fn default_write_guard_secs() -> i64 {
    60
}

/// Overrides for one category. Unset fields use the category's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<i64>,
}

/// Category overrides, one table per category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoriesConfig {
    #[serde(default)]
    pub seed: CategoryConfig,
    #[serde(default)]
    pub leaf: CategoryConfig,
    #[serde(default)]
    pub branch: CategoryConfig,
    /// Root entries never expire, so only `capacity` applies
    #[serde(default)]
    pub root: CategoryConfig,
}

impl CategoriesConfig {
    pub fn get(&self, category: Category) -> &CategoryConfig {
        match category {
            Category::Seed => &self.seed,
            Category::Leaf => &self.leaf,
            Category::Branch => &self.branch,
            Category::Root => &self.root,
        }
    }

    /// Effective policy for `category`
    pub fn policy(&self, category: Category) -> CategoryPolicy {
        let overrides = self.get(category);
        let defaults = CategoryPolicy::defaults(category);
        CategoryPolicy {
            capacity: overrides.capacity.unwrap_or(defaults.capacity),
            retention: match category {
                Category::Root => None,
                _ => overrides
                    .retention_days
                    .map(|days| Duration::try_days(days).unwrap_or(Duration::MAX))
                    .or(defaults.retention),
            },
        }
    }
}

/// Archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// PBKDF2 iterations per record key (minimum 480000)
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    /// Deadline for one encryption or decryption, in seconds
    #[serde(default = "default_kdf_timeout_secs")]
    pub kdf_timeout_secs: u64,
    /// Environment variable holding the master secret
    #[serde(default = "default_master_secret_env")]
    pub master_secret_env: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: default_kdf_iterations(),
            kdf_timeout_secs: default_kdf_timeout_secs(),
            master_secret_env: default_master_secret_env(),
        }
    }
}

fn default_kdf_iterations() -> u32 {
    MIN_KDF_ITERATIONS
}

fn default_kdf_timeout_secs() -> u64 {
    30
}

fn default_master_secret_env() -> String {
    "ARBOR_MASTER_SECRET".to_string()
}

/// Consolidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Store size at which scoring moves to the blocking pool
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
    /// Entries per scoring task
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Pause before retrying a failed archive transfer, in milliseconds
    #[serde(default = "default_transfer_retry_backoff_ms")]
    pub transfer_retry_backoff_ms: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: default_parallel_threshold(),
            chunk_size: default_chunk_size(),
            transfer_retry_backoff_ms: default_transfer_retry_backoff_ms(),
        }
    }
}

fn default_parallel_threshold() -> usize {
    512
}

fn default_chunk_size() -> usize {
    256
}

fn default_transfer_retry_backoff_ms() -> u64 {
    50
}

impl Config {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArborError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ArborError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Places searched for a config file when none is given, in order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::home_dir().map(|h| h.join(".arbor").join("config.toml")),
            dirs::config_dir().map(|c| c.join("arbor").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Load the first config file found in [`default_paths`](Self::default_paths),
    /// falling back to defaults
    pub fn discover() -> Result<Self> {
        for path in Self::default_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load `path` if given, otherwise discover
    pub fn load_or_discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::discover(),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = data_dir.into();
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;

        if self.buffer.capacity == 0 {
            return Err(ArborError::Config("buffer.capacity must be positive".into()));
        }
        if self.buffer.retention_hours <= 0 || self.buffer.write_guard_secs < 0 {
            return Err(ArborError::Config(
                "buffer.retention_hours must be positive and buffer.write_guard_secs non-negative"
                    .into(),
            ));
        }
        if Duration::try_hours(self.buffer.retention_hours).is_none() {
            return Err(ArborError::Config(format!(
                "buffer.retention_hours is out of range, got {}",
                self.buffer.retention_hours
            )));
        }
        if Duration::try_seconds(self.buffer.write_guard_secs).is_none() {
            return Err(ArborError::Config(format!(
                "buffer.write_guard_secs is out of range, got {}",
                self.buffer.write_guard_secs
            )));
        }
        if self.categories.root.retention_days.is_some() {
            return Err(ArborError::Config(
                "categories.root.retention_days cannot be set: root entries never expire".into(),
            ));
        }
        for category in Category::ALL {
            if let Some(days) = self.categories.get(category).retention_days {
                if days <= 0 || Duration::try_days(days).is_none() {
                    return Err(ArborError::Config(format!(
                        "categories.{category}.retention_days must be a positive number of days in range, got {days}"
                    )));
                }
            }
        }
        if self.archive.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(ArborError::Config(format!(
                "archive.kdf_iterations must be at least {MIN_KDF_ITERATIONS}, got {}",
                self.archive.kdf_iterations
            )));
        }
        if self.archive.kdf_timeout_secs == 0 {
            return Err(ArborError::Config("archive.kdf_timeout_secs must be positive".into()));
        }
        if self.archive.master_secret_env.trim().is_empty() {
            return Err(ArborError::Config("archive.master_secret_env must not be empty".into()));
        }
        if self.consolidation.chunk_size == 0 {
            return Err(ArborError::Config("consolidation.chunk_size must be positive".into()));
        }
        Ok(())
    }

    pub fn buffer_policy(&self) -> BufferPolicy {
        BufferPolicy {
            capacity: self.buffer.capacity,
            retention: Duration::try_hours(self.buffer.retention_hours).unwrap_or(Duration::MAX),
            write_guard: Duration::try_seconds(self.buffer.write_guard_secs).unwrap_or(Duration::MAX),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            policies: Category::ALL.map(|category| self.categories.policy(category)),
            io_backoff: StdDuration::from_millis(self.storage.io_retry_backoff_ms),
        }
    }

    pub fn archive_options(&self) -> Result<ArchiveOptions> {
        Ok(ArchiveOptions {
            kdf: KdfParams::new(self.archive.kdf_iterations)?,
            crypto_deadline: StdDuration::from_secs(self.archive.kdf_timeout_secs),
            io_backoff: StdDuration::from_millis(self.storage.io_retry_backoff_ms),
        })
    }

    pub fn consolidator_config(&self) -> ConsolidatorConfig {
        ConsolidatorConfig {
            parallel_threshold: self.consolidation.parallel_threshold,
            chunk_size: self.consolidation.chunk_size,
            transfer_retry_backoff: StdDuration::from_millis(
                self.consolidation.transfer_retry_backoff_ms,
            ),
        }
    }
}
