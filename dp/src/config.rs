//! Daemon configuration
//!
//! Loaded from YAML with kebab-case keys. Lookup order: explicit path,
//! `.datapress.yml` in the working directory, then
//! `~/.config/datapress/datapress.yml`, then built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerConfig {
    /// Concurrent task slots
    pub concurrency: usize,
    /// Idle wait between acquisition sweeps
    pub poll_interval_ms: u64,
    /// Delay before an automatic retry; 0 disables retries
    pub error_retry_delay_ms: u64,
    /// Run each task in an isolated child process
    pub spawn_task: bool,
    /// Lock owner label, useful when several workers share a store
    pub owner: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 2000,
            error_retry_delay_ms: 600_000,
            spawn_task: false,
            owner: "worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConfig {
    /// `sqlite` or `memory`
    pub backend: String,
    /// Database file for the sqlite backend
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: None,
        }
    }
}

impl Config {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(".datapress.yml");
        if local.exists() {
            return Self::from_file(&local);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("datapress").join("datapress.yml");
            if user.exists() {
                return Self::from_file(&user);
            }
        }

        debug!("Config::load: no config file found, using defaults");
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading config {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&text).wrap_err_with(|| format!("parsing config {}", path.display()))?;
        debug!(path = %path.display(), "Config::load: loaded");
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    /// `None` when retries are disabled
    pub fn error_retry_delay(&self) -> Option<Duration> {
        (self.worker.error_retry_delay_ms > 0).then(|| Duration::from_millis(self.worker.error_retry_delay_ms))
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("datapress")
                .join("datapress.db")
        })
    }
}
