//! Configuration management for the restore engine.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::error::CoreError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub restic: ResticConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long an in-memory repository entry is served without a store read
    #[serde(default = "default_memory_ttl_secs")]
    pub memory_ttl_secs: u64,

    /// Minimum time between two delta checks of the same repository
    #[serde(default = "default_delta_check_interval_secs")]
    pub delta_check_interval_secs: u64,

    /// Newest snapshots whose stats are fetched first on a cold start
    #[serde(default = "default_priority_count")]
    pub priority_count: usize,

    /// Stats calls issued concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timeout for a single stats call
    #[serde(default = "default_stats_timeout_secs")]
    pub stats_timeout_secs: u64,

    /// Extra attempts for a failed stats call
    #[serde(default = "default_stats_retries")]
    pub stats_retries: u32,

    /// Initial backoff between stats attempts, doubled after each failure
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResticConfig {
    /// Explicit restic binary, otherwise well-known locations then PATH
    #[serde(default)]
    pub binary: Option<PathBuf>,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the snapshot database and the repository list
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_memory_ttl_secs() -> u64 {
    30 * 60
}

fn default_delta_check_interval_secs() -> u64 {
    2 * 60 * 60
}

fn default_priority_count() -> usize {
    20
}

fn default_batch_size() -> usize {
    5
}

fn default_stats_timeout_secs() -> u64 {
    600
}

fn default_stats_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_command_timeout_secs() -> u64 {
    30 * 60
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("restic-restore")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl_secs: default_memory_ttl_secs(),
            delta_check_interval_secs: default_delta_check_interval_secs(),
            priority_count: default_priority_count(),
            batch_size: default_batch_size(),
            stats_timeout_secs: default_stats_timeout_secs(),
            stats_retries: default_stats_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for ResticConfig {
    fn default() -> Self {
        Self {
            binary: None,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CacheConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_secs(self.stats_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("snapshots.db")
    }

    pub fn repositories_path(&self) -> PathBuf {
        self.data_dir.join("repositories.json")
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))
    }

    /// File (if any), then `.env`, then `RESTORE_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("RESTORE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(binary) = std::env::var("RESTORE_RESTIC_BINARY") {
            self.restic.binary = Some(PathBuf::from(binary));
        }
        if let Ok(level) = std::env::var("RESTORE_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(ttl) = env_parse("RESTORE_CACHE_TTL_SECS") {
            self.cache.memory_ttl_secs = ttl;
        }
        if let Some(interval) = env_parse("RESTORE_DELTA_INTERVAL_SECS") {
            self.cache.delta_check_interval_secs = interval;
        }
        if let Some(batch) = env_parse("RESTORE_BATCH_SIZE") {
            self.cache.batch_size = batch;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.memory_ttl_secs, 1800);
        assert_eq!(config.cache.delta_check_interval_secs, 7200);
        assert_eq!(config.cache.priority_count, 20);
        assert_eq!(config.cache.batch_size, 5);
        assert!(config.storage.db_path().ends_with("snapshots.db"));
    }

    #[test]
    fn test_partial_toml_takes_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            batch_size = 3

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.batch_size, 3);
        assert_eq!(config.cache.stats_retries, 2);
        assert_eq!(config.log.level, "debug");
        assert!(config.restic.binary.is_none());
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let cache = CacheConfig {
            batch_size: 0,
            ..CacheConfig::default()
        };
        assert_eq!(cache.batch_size(), 1);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("restore.toml");
        std::fs::write(&path, "[storage]\ndata_dir = \"/tmp/restore-test\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/restore-test"));
    }
}
