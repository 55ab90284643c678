use fundflow_core::DomainError;

use super::store::JobStoreError;
use crate::repository::RepositoryError;

/// Failure of a job delivery, a trigger run or handler registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("malformed payload for queue {queue}: {message}")]
    MalformedPayload { queue: String, message: String },

    #[error("no handler registered for queue {0}")]
    HandlerNotFound(String),

    #[error("a handler is already registered for queue {0}")]
    DuplicateHandler(String),

    #[error("invalid schedule {expression:?} for queue {queue}: {message}")]
    InvalidSchedule {
        queue: String,
        expression: String,
        message: String,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("failed to enqueue job on {queue}: {message}")]
    Enqueue { queue: String, message: String },

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Retrying cannot succeed; the job goes straight to the dead-letter queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MalformedPayload { .. } | Self::HandlerNotFound(_))
    }
}
