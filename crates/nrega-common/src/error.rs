//! Error types shared across MGNREGA crates

use thiserror::Error;

/// Result type alias for MGNREGA operations
pub type Result<T> = std::result::Result<T, NregaError>;

/// Main error type for MGNREGA crates
#[derive(Error, Debug)]
pub enum NregaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

impl NregaError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        NregaError::Config(message.into())
    }
}
