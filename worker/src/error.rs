use thiserror::Error;

use bpow_work::WorkError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("work error: {0}")]
    Work(#[from] WorkError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
