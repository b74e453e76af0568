use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("no valid work for {hash} before the deadline")]
    Timeout { hash: String },

    #[error("hub is not running")]
    HubClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
