use super::models::JobStatus;
use super::queue::QueueError;
use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

/// Errors surfaced by job operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("task not found: {0}")]
    NotFound(String),

    /// The requested operation is not allowed in the record's current state.
    /// The message is user facing.
    #[error("{0}")]
    InvalidState(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job queue error: {0}")]
    Transport(#[from] QueueError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl JobError {
    pub fn transition(from: JobStatus, to: JobStatus) -> Self {
        JobError::InvalidState(format!("cannot move task from {} to {}", from, to))
    }

    /// Short machine-readable code, used in API and live-update error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "not_found",
            JobError::InvalidState(_) => "invalid_state",
            JobError::Permission(_) => "forbidden",
            JobError::Validation(_) => "validation",
            JobError::Transport(_) => "queue_unavailable",
            JobError::Database(_) | JobError::Internal(_) => "internal",
        }
    }
}
