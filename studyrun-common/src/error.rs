//! Common error types for studyrun

use thiserror::Error;

/// Common result type for studyrun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the server and the client mirror
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or rejected input (unknown payload shape, missing consent, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown participant, experiment or task id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Task state-machine move that is not allowed (e.g. in_progress -> pending)
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Storage read or write failure (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Storage failure that did not originate in sqlx (lock wait exhausted, corrupt row)
    #[error("Persistence error: {0}")]
    Storage(String),

    /// Local cache could not be read back
    #[error("Restore error: {0}")]
    Restore(String),

    /// Audit log write failure; never fatal for the transition it describes
    #[error("Logging error: {0}")]
    Logging(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors raised before any write was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::NotFound(_) | Error::InvalidTransition(_)
        )
    }

    /// True for storage failures that the caller must surface as unsynced.
    pub fn is_persistence(&self) -> bool {
        match self {
            #[cfg(feature = "sqlx")]
            Error::Persistence(_) => true,
            Error::Storage(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(Error::NotFound("exp9".into()).is_validation());
        assert!(Error::Validation("bad payload".into()).is_validation());
        assert!(Error::InvalidTransition("in_progress -> pending".into()).is_validation());
        assert!(!Error::Logging("disk full".into()).is_validation());
    }

    #[test]
    fn test_persistence_classification() {
        assert!(Error::Storage("locked".into()).is_persistence());
        assert!(!Error::Restore("corrupt".into()).is_persistence());
    }
}
