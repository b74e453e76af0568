use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkError {
    #[error("work value {actual:#018x} below threshold {threshold:#018x}")]
    InsufficientDifficulty { actual: u64, threshold: u64 },

    #[error("work generation cancelled")]
    Cancelled,
}
