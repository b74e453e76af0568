//! Broker configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use bpow_types::PrincipalKind;

use crate::admission::DEFAULT_DENIED_RANGES;
use crate::BrokerError;

/// A static credential accepted by the built-in authenticator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub identity: String,
    pub kind: PrincipalKind,
}

/// Configuration for the broker process.
///
/// Loaded from a TOML file via [`BrokerConfig::from_toml_file`]; every field
/// has a default so an empty file is valid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// First-tier wait on the selected bucket, in milliseconds.
    #[serde(default = "default_short_timeout_ms")]
    pub short_timeout_ms: u64,

    /// Second-tier wait on every bucket, in milliseconds.
    #[serde(default = "default_long_timeout_ms")]
    pub long_timeout_ms: u64,

    /// Time allowed to write one frame to a worker.
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,

    /// Read deadline; any frame from the worker refreshes it.
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,

    /// Largest frame accepted from a worker, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue; a full queue marks the peer dead.
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,

    /// Capacity of the hub command channel.
    #[serde(default = "default_hub_queue_size")]
    pub hub_queue_size: usize,

    /// Capacity of the credit event queue.
    #[serde(default = "default_credit_queue_size")]
    pub credit_queue_size: usize,

    /// How many address→bucket assignments are remembered for reconnects.
    #[serde(default = "default_bucket_memory")]
    pub bucket_memory: usize,

    /// Total reward used to estimate a worker's award.
    #[serde(default = "default_prize_pool")]
    pub prize_pool: f64,

    /// Requesters whose results are cached but never credited.
    #[serde(default = "default_no_credit_requesters")]
    pub no_credit_requesters: Vec<String>,

    /// Use `X-Real-Ip` / `X-Forwarded-For` to find the client address.
    #[serde(default = "default_true")]
    pub trust_proxy_headers: bool,

    /// CIDR ranges (or single addresses) refused at admission.
    #[serde(default = "default_denied_ranges")]
    pub denied_ranges: Vec<String>,

    /// Invalid results tolerated from one address before it is banned.
    #[serde(default = "default_max_invalid_results")]
    pub max_invalid_results: u32,

    /// Ban length after too many invalid results.
    #[serde(default = "default_invalid_ban_secs")]
    pub invalid_ban_secs: u64,

    /// How long a cached result is served without asking the pool.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Whether to serve `GET /metrics`.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Static credentials for the built-in authenticator.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_short_timeout_ms() -> u64 {
    1_000
}

fn default_long_timeout_ms() -> u64 {
    30_000
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_max_message_size() -> usize {
    512
}

fn default_outbound_queue_size() -> usize {
    256
}

fn default_hub_queue_size() -> usize {
    1024
}

fn default_credit_queue_size() -> usize {
    100
}

fn default_bucket_memory() -> usize {
    10_000
}

fn default_prize_pool() -> f64 {
    10_000.0
}

fn default_no_credit_requesters() -> Vec<String> {
    vec!["vault@banano.cc".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_denied_ranges() -> Vec<String> {
    DEFAULT_DENIED_RANGES.iter().map(|s| s.to_string()).collect()
}

fn default_max_invalid_results() -> u32 {
    5
}

fn default_invalid_ban_secs() -> u64 {
    3_600
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl BrokerConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BrokerError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, BrokerError> {
        toml::from_str(s).map_err(|e| BrokerError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, BrokerError> {
        toml::to_string_pretty(self).map_err(|e| BrokerError::Config(e.to_string()))
    }

    pub fn short_timeout(&self) -> Duration {
        Duration::from_millis(self.short_timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Pings go out at 9/10 of the read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn invalid_ban(&self) -> Duration {
        Duration::from_secs(self.invalid_ban_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            short_timeout_ms: default_short_timeout_ms(),
            long_timeout_ms: default_long_timeout_ms(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            max_message_size: default_max_message_size(),
            outbound_queue_size: default_outbound_queue_size(),
            hub_queue_size: default_hub_queue_size(),
            credit_queue_size: default_credit_queue_size(),
            bucket_memory: default_bucket_memory(),
            prize_pool: default_prize_pool(),
            no_credit_requesters: default_no_credit_requesters(),
            trust_proxy_headers: default_true(),
            denied_ranges: default_denied_ranges(),
            max_invalid_results: default_max_invalid_results(),
            invalid_ban_secs: default_invalid_ban_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            enable_metrics: default_true(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            tokens: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = BrokerConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = BrokerConfig::from_toml_str(&toml_str).expect("should parse");
        assert_eq!(parsed.long_timeout_ms, config.long_timeout_ms);
        assert_eq!(parsed.denied_ranges, config.denied_ranges);
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let config = BrokerConfig::from_toml_str("").expect("empty toml should use defaults");
        assert_eq!(config.short_timeout(), Duration::from_secs(1));
        assert_eq!(config.long_timeout(), Duration::from_secs(30));
        assert_eq!(config.ping_period(), Duration::from_secs(54));
        assert_eq!(config.max_message_size, 512);
        assert_eq!(config.no_credit_requesters, vec!["vault@banano.cc"]);
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn partial_toml_overrides() {
        let toml = r#"
            short_timeout_ms = 250
            prize_pool = 500.0

            [[tokens]]
            token = "abc"
            identity = "worker@example.com"
            kind = "provider"
        "#;
        let config = BrokerConfig::from_toml_str(toml).expect("should parse");
        assert_eq!(config.short_timeout(), Duration::from_millis(250));
        assert_eq!(config.prize_pool, 500.0);
        assert_eq!(config.tokens.len(), 1);
        assert_eq!(config.tokens[0].kind, PrincipalKind::Provider);
        assert_eq!(config.log_format, "human");
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = \"127.0.0.1:9000\"").unwrap();
        let config = BrokerConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn missing_file_returns_config_error() {
        let result = BrokerConfig::from_toml_file("/nonexistent/bpow.toml");
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }
}
