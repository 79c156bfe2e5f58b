//! Ingestion error taxonomy
//!
//! Each pipeline stage has its own error type. None of them is fatal to the
//! host process: the pipeline folds all of them into a [`RunOutcome`].
//!
//! [`RunOutcome`]: crate::models::RunOutcome

use std::time::Duration;
use thiserror::Error;

/// A single upstream retrieval attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),
}

/// One upstream entry failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for field '{field}': {detail}")]
    InvalidField { field: &'static str, detail: String },

    #[error("malformed entry: {0}")]
    MalformedEntry(String),
}

impl ValidationError {
    pub fn invalid(field: &'static str, detail: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            detail: detail.into(),
        }
    }
}

/// The payload as a whole could not be split into entries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unsupported payload format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A store operation failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Worth retrying on a later run (serialization failure, deadlock)
    #[error("transient storage error: {0}")]
    Transient(String),

    /// No connection to the store could be obtained
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation
    #[error("permanent storage error: {0}")]
    Permanent(String),

    /// `insert` lost a race with another writer for the same key
    #[error("record already exists: {0}")]
    DuplicateKey(String),
}

impl StorageError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, StorageError::Permanent(_))
    }

    /// Errors that will repeat for every remaining record of a batch
    pub fn dooms_batch(&self) -> bool {
        matches!(self, StorageError::Permanent(_) | StorageError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StorageError::DuplicateKey(db.message().to_string())
            },
            // serialization failure / deadlock
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) =>
            {
                StorageError::Transient(db.message().to_string())
            },
            _ => StorageError::Permanent(err.to_string()),
        }
    }
}
