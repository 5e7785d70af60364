//! Unified error handling for quotacycle-core

use thiserror::Error;

/// Core error type for quotacycle-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// A stored row could not be decoded (bad timestamp, unknown provider)
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A store failure annotated with the quota and operation it interrupted
    #[error("{operation} failed for {quota}: {source}")]
    Quota {
        quota: String,
        operation: String,
        #[source]
        source: Box<Error>,
    },
}

/// Result type alias for quotacycle-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a corrupt-record error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// Wrap this error with the quota key and the operation that failed
    pub fn in_quota(self, quota: impl ToString, operation: impl Into<String>) -> Self {
        Error::Quota {
            quota: quota.to_string(),
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// Quota key attached to this error, if any
    pub fn quota(&self) -> Option<&str> {
        match self {
            Error::Quota { quota, .. } => Some(quota),
            _ => None,
        }
    }
}

// Convert to String for CLI and UI boundaries
impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}
