//! Client error types

use studyrun_common::models::TaskStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Local copy exists but could not be read back
    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Local storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Server answered with an error body
    #[error("Rejected by server ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("No participant cached")]
    NoParticipant,

    #[error("No experiment in progress")]
    NoActiveExperiment,

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl ClientError {
    /// Whether the server refused the request as invalid (4xx)
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Rejected { status, .. } if (400..500).contains(status))
    }

    /// Whether resubmitting the same action later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
