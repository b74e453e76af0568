//! Worker configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use bpow_work::MAX_MULTIPLIER;

use crate::WorkerError;

/// Configuration for the worker process.
///
/// Every field has a default except the token, which must be supplied either
/// in the file or on the command line before [`WorkerConfig::validate`]
/// passes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// WebSocket endpoint of the broker.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Sent verbatim as the `Authorization` header.
    #[serde(default)]
    pub token: String,

    /// Number of work items computed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Backlog size; requests arriving at a full backlog are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Hard deadline for one computation.
    #[serde(default = "default_compute_timeout_secs")]
    pub compute_timeout_secs: u64,

    /// Pause between reconnect attempts.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Requests below this multiplier are ignored.
    #[serde(default = "default_min_difficulty")]
    pub min_difficulty: u32,

    /// Requests above this multiplier are ignored.
    #[serde(default = "default_max_difficulty")]
    pub max_difficulty: u32,

    /// Ignore speculative precache requests.
    #[serde(default)]
    pub skip_precache: bool,

    /// Threads for the CPU engine. Unset means one per core.
    #[serde(default)]
    pub cpu_threads: Option<usize>,

    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_server_url() -> String {
    "wss://boompow.banano.cc/ws/worker".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    100
}

fn default_compute_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    2
}

fn default_min_difficulty() -> u32 {
    1
}

fn default_max_difficulty() -> u32 {
    MAX_MULTIPLIER
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WorkerConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, WorkerError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| WorkerError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, WorkerError> {
        toml::from_str(s).map_err(|e| WorkerError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, WorkerError> {
        toml::to_string_pretty(self).map_err(|e| WorkerError::Config(e.to_string()))
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.token.trim().is_empty() {
            return Err(WorkerError::Config("an auth token is required".into()));
        }
        if self.concurrency == 0 {
            return Err(WorkerError::Config("concurrency must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(WorkerError::Config("queue_capacity must be at least 1".into()));
        }
        if self.min_difficulty > self.max_difficulty {
            return Err(WorkerError::Config(format!(
                "min_difficulty {} exceeds max_difficulty {}",
                self.min_difficulty, self.max_difficulty
            )));
        }
        if self.cpu_threads == Some(0) {
            return Err(WorkerError::Config("cpu_threads must be at least 1".into()));
        }
        Ok(())
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: String::new(),
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            compute_timeout_secs: default_compute_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            min_difficulty: default_min_difficulty(),
            max_difficulty: default_max_difficulty(),
            skip_precache: false,
            cpu_threads: None,
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = WorkerConfig::from_toml_str("").unwrap();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.compute_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.max_difficulty, 128);
        assert!(config.cpu_threads.is_none());
    }

    #[test]
    fn token_is_required() {
        let config = WorkerConfig::default();
        assert!(matches!(config.validate(), Err(WorkerError::Config(_))));

        let config = WorkerConfig {
            token: "abc".into(),
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_difficulty_range_is_rejected() {
        let config = WorkerConfig {
            token: "abc".into(),
            min_difficulty: 64,
            max_difficulty: 8,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = WorkerConfig {
            token: "abc".into(),
            cpu_threads: Some(4),
            skip_precache: true,
            ..WorkerConfig::default()
        };
        let parsed = WorkerConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(parsed.token, "abc");
        assert_eq!(parsed.cpu_threads, Some(4));
        assert!(parsed.skip_precache);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server_url = \"ws://127.0.0.1:8080/ws/worker\"").unwrap();
        writeln!(file, "concurrency = 3").unwrap();
        let config = WorkerConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.server_url, "ws://127.0.0.1:8080/ws/worker");
        assert_eq!(config.concurrency, 3);
    }
}
