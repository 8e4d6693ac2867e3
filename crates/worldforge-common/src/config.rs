//! Configuration types for Worldforge
//!
//! Every section has defaults so a partial (or missing) TOML file is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project locations
    pub project: ProjectConfig,
    /// Document manager batching and persistence
    pub manager: ManagerConfig,
    /// Terrain base cache
    pub terrain: TerrainConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Configuration(format!("invalid config: {e}")))?;
        config.manager.validate()?;
        config.terrain.validate()?;
        Ok(config)
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Project locations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directory holding the document store and asset archive
    pub data_dir: PathBuf,
    /// Directory holding derived caches (safe to delete)
    pub cache_dir: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./worldforge-data"),
            cache_dir: PathBuf::from("./worldforge-data/cache"),
        }
    }
}

/// Document manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Capacity of the pending-update queue
    pub queue_capacity: usize,
    /// Maximum updates drained into one batch
    pub batch_size: usize,
    /// Maximum time spent filling one batch (milliseconds)
    pub batch_window_ms: u64,
    /// Maximum simultaneous persistence operations
    pub max_concurrent_saves: usize,
    /// How long a saturated-queue retry waits before saving directly (milliseconds)
    pub enqueue_retry_timeout_ms: u64,
    /// Upper bound on the shutdown drain (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_size: 50,
            batch_window_ms: 2000,
            max_concurrent_saves: 16,
            enqueue_retry_timeout_ms: 5000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ManagerConfig {
    /// Reject settings that would stall the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Configuration("queue_capacity must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be > 0".into()));
        }
        if self.max_concurrent_saves == 0 {
            return Err(Error::Configuration(
                "max_concurrent_saves must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn enqueue_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_retry_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Terrain base cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Parallel archive reads while building the base cache
    pub archive_read_concurrency: usize,
    /// File name of the derived base cache inside `cache_dir`
    pub base_cache_file: String,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            archive_read_concurrency: 64,
            base_cache_file: "terrain_base.bin".to_string(),
        }
    }
}

impl TerrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.archive_read_concurrency == 0 {
            return Err(Error::Configuration(
                "archive_read_concurrency must be > 0".into(),
            ));
        }
        if self.base_cache_file.is_empty() {
            return Err(Error::Configuration("base_cache_file must be set".into()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
