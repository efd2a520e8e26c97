//! Typed configuration.
//!
//! [`Config`] comes from environment variables, loaded once at startup,
//! and fails fast if required vars are missing. [`QueueConfig`] holds the
//! queue's processing guarantees and is read from a TOML file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding the pending tasks.
    pub db_path: PathBuf,
    /// Optional TOML file with a [`QueueConfig`].
    pub queue_config_path: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_path: PathBuf::from(required_var("PENDING_DB_PATH")?),
            queue_config_path: std::env::var("PENDING_QUEUE_CONFIG").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// The queue config from `queue_config_path`, or defaults.
    pub fn queue_config(&self) -> Result<QueueConfig> {
        match self.queue_config_path {
            Some(ref path) => QueueConfig::load(path),
            None => Ok(QueueConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Processing guarantees of a queue, made explicit.
///
/// ```toml
/// automatically_run_tasks = true
/// max_attempts = 5
/// poll_interval_secs = 60
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Run tasks on submission and on the poll interval. When false, tasks
    /// only run through explicit `run_tasks`/`run_task` calls.
    pub automatically_run_tasks: bool,
    /// Runs before a failing task goes dead. Unset means retry forever.
    pub max_attempts: Option<u32>,
    /// How often the control plane runs a pass without being woken.
    pub poll_interval_secs: u64,
    /// Tries per store write before the writer gives up on it.
    pub store_retry_attempts: u32,
    /// Events buffered per subscriber before slow ones start lagging.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            automatically_run_tasks: true,
            max_attempts: None,
            poll_interval_secs: 15 * 60,
            store_retry_attempts: 3,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read queue config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad queue config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        if config.max_attempts == Some(0) {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if config.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".to_string()));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
