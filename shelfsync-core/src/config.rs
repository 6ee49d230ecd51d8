//! Daemon configuration — `~/.shelfsync/config.yaml`.
//!
//! Every field is optional; a missing file yields [`Config::default`].
//!
//! ```yaml
//! stream_url: wss://stream.zotero.org
//! live: true
//! concurrency: 4
//! sync_concurrency: 2
//! jobs:
//!   delay_ms: 0
//!   attempts: 3
//!   backoff: { kind: exponential, delay_ms: 1000 }
//! shutdown_timeout_ms: 5000
//! resync_interval_secs: 3600
//! reconnect: { initial_backoff_ms: 1000, max_backoff_ms: 60000 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Backoff, RetryPolicy};

pub const ROOT_DIR: &str = ".shelfsync";
pub const CONFIG_FILE: &str = "config.yaml";

/// `<home>/.shelfsync`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(ROOT_DIR)
}

/// `<home>/.shelfsync/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join(CONFIG_FILE)
}

/// Home directory from `dirs::home_dir()`.
pub fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Push-notification stream endpoint.
    pub stream_url: String,
    /// Live-update mode: run the Listener.
    pub live: bool,
    /// Job-queue worker count.
    pub concurrency: usize,
    /// Cap on subscriptions mid-sync during a bulk synchronize.
    pub sync_concurrency: usize,
    pub jobs: JobDefaults,
    pub shutdown_timeout_ms: u64,
    /// When set, a `sync {all}` job is enqueued on this period.
    pub resync_interval_secs: Option<u64>,
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream_url: "wss://stream.zotero.org".to_string(),
            live: false,
            concurrency: 4,
            sync_concurrency: 2,
            jobs: JobDefaults::default(),
            shutdown_timeout_ms: 5_000,
            resync_interval_secs: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Defaults applied to every enqueued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub delay_ms: u64,
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobDefaults {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            delay_ms: 0,
            attempts: policy.attempts,
            backoff: policy.backoff,
        }
    }
}

impl JobDefaults {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.max(1),
            backoff: self.backoff,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Listener reconnection backoff bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl Config {
    /// Load `<home>/.shelfsync/config.yaml`, or defaults if it is absent.
    pub fn load_at(home: &Path) -> Result<Self, CoreError> {
        let path = config_path_at(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| CoreError::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let config: Config = serde_yaml::from_str(&contents).map_err(|e| CoreError::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(config.normalized())
    }

    /// `load_at` convenience wrapper.
    pub fn load() -> Result<Self, CoreError> {
        Self::load_at(&home()?)
    }

    /// Clamp worker counts to at least one.
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self.sync_concurrency = self.sync_concurrency.max(1);
        self.jobs.attempts = self.jobs.attempts.max(1);
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().unwrap();
        let config = Config::load_at(home.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.live);
        assert_eq!(config.resync_interval(), None);
    }

    #[test]
    fn partial_file_overrides_and_clamps() {
        let home = TempDir::new().unwrap();
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "live: true\nsync_concurrency: 0\njobs:\n  attempts: 5\n  backoff: { kind: fixed, delay_ms: 20 }\n",
        )
        .unwrap();

        let config = Config::load_at(home.path()).unwrap();
        assert!(config.live);
        assert_eq!(config.sync_concurrency, 1);
        assert_eq!(config.concurrency, 4);
        assert_eq!(
            config.jobs.retry_policy(),
            RetryPolicy {
                attempts: 5,
                backoff: Backoff::Fixed { delay_ms: 20 }
            }
        );
    }

    #[test]
    fn malformed_file_reports_path() {
        let home = TempDir::new().unwrap();
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "concurrency: [not, a, number]\n").unwrap();
        let err = Config::load_at(home.path()).unwrap_err();
        assert!(err.to_string().contains("config.yaml"));
    }
}
