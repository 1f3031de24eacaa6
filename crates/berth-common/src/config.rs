//! Global configuration model for berth.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

/// Root configuration for the build pipeline and the runtime.
///
/// Every field has a default, so a missing or partial `config.json` is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    /// Base directory for berth state and data.
    pub data_dir: PathBuf,
    /// Package index URI (`file://…` or `http(s)://…`).
    pub package_index: String,
    /// Supervision defaults applied when a service does not override them.
    pub supervisor: SupervisorSettings,
}

impl Default for BerthConfig {
    fn default() -> Self {
        let data_dir = crate::constants::data_dir().clone();
        let package_index = format!("file://{}", data_dir.join("index").display());
        Self {
            data_dir,
            package_index,
            supervisor: SupervisorSettings::default(),
        }
    }
}

impl BerthConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Loads `config.json` from the given data directory and pins the data
    /// directory to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_data_dir(data_dir: &Path) -> Result<Self> {
        let mut config = Self::load(&crate::constants::config_file(data_dir))?;
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }
}

/// Worker pool and restart timing defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Number of workers when the service does not say.
    pub workers: usize,
    /// How long a worker must survive before it counts as running.
    pub ready_after_ms: u64,
    /// How long a worker must run before the crash counter resets.
    pub stable_after_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on shutdown.
    pub graceful_timeout_ms: u64,
    /// First restart delay.
    pub backoff_initial_ms: u64,
    /// Upper bound on the restart delay.
    pub backoff_max_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            ready_after_ms: 500,
            stable_after_ms: 10_000,
            graceful_timeout_ms: 5_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 30_000,
        }
    }
}

impl SupervisorSettings {
    /// Readiness window as a `Duration`.
    #[must_use]
    pub const fn ready_after(&self) -> Duration {
        Duration::from_millis(self.ready_after_ms)
    }

    /// Stability window as a `Duration`.
    #[must_use]
    pub const fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub const fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    /// First restart delay as a `Duration`.
    #[must_use]
    pub const fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// Restart delay cap as a `Duration`.
    #[must_use]
    pub const fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
