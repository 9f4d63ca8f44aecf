//! TOML configuration for the queue, the workers and task defaults.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```toml
//! [queue]
//! name = "task_queue"
//! dependency_backoff_ms = 60000
//!
//! [worker]
//! count = 4
//! readiness_delay_ms = 60000
//! execution_timeout_ms = 30000
//! reconnect_backoff_ms = 1000
//!
//! [tasks]
//! default_max_retries = 3
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::app::WorkerSettings;
use crate::queue::QueueSettings;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ORDO_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file at {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing TOML config from {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrdoConfig {
    pub queue: QueueSection,
    pub worker: WorkerSection,
    pub tasks: TasksSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSection {
    pub name: String,
    pub dependency_backoff_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: "task_queue".to_string(),
            dependency_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    pub count: usize,
    /// Delay before a task held back by a gate is delivered again.
    pub readiness_delay_ms: u64,
    pub execution_timeout_ms: Option<u64>,
    pub reconnect_backoff_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            count: 1,
            readiness_delay_ms: 60_000,
            execution_timeout_ms: None,
            reconnect_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksSection {
    pub default_max_retries: u32,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
        }
    }
}

impl OrdoConfig {
    pub fn from_toml_str(contents: &str, origin: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: origin.into(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.name must not be empty".into()));
        }
        if self.queue.dependency_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "queue.dependency_backoff_ms must be greater than zero".into(),
            ));
        }
        if self.worker.count == 0 {
            return Err(ConfigError::Invalid("worker.count must be at least 1".into()));
        }
        if self.worker.readiness_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.readiness_delay_ms must be greater than zero".into(),
            ));
        }
        if self.worker.execution_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "worker.execution_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            name: self.queue.name.clone(),
            dependency_backoff: Duration::from_millis(self.queue.dependency_backoff_ms),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            redelivery_delay: Duration::from_millis(self.worker.readiness_delay_ms),
            execution_timeout: self.worker.execution_timeout_ms.map(Duration::from_millis),
            reconnect_backoff: Duration::from_millis(self.worker.reconnect_backoff_ms),
        }
    }
}

/// Read and deserialize a config file. No semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<OrdoConfig, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    OrdoConfig::from_toml_str(&contents, path)
}

pub fn load_and_validate(path: impl AsRef<Path>) -> Result<OrdoConfig, ConfigError> {
    let config = load_from_path(path)?;
    config.validate()?;
    Ok(config)
}

/// `$ORDO_CONFIG` if set, else `Ordo.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("Ordo.toml"))
}
