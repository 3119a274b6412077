use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlendError {
    /// Caller passed an inconsistent request (weights vs. strategies, bad capital, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid series: {0}")]
    InvalidSeries(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Optimization error: {0}")]
    Optimization(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

pub type BlendResult<T> = Result<T, BlendError>;
