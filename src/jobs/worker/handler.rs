use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::jobs::error::JobResult;
use crate::jobs::models::{JobType, Payload};
use crate::jobs::reporter::ProgressReporter;

/// Error returned by a handler. Serialized into the record's `error_info`.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    /// Ask the pool to run the job again while the record has retries left.
    #[serde(skip)]
    pub retryable: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(message)
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_payload(&self) -> Payload {
        Payload::encode(self)
            .unwrap_or_else(|_| Payload::from(serde_json::json!({ "message": self.message })))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(format!("invalid parameters: {}", err))
    }
}

/// What a handler sees while it runs.
#[derive(Clone)]
pub struct HandlerContext {
    pub task_id: String,
    /// The id the queue knows the job by.
    pub job_id: String,
    pub parameters: Payload,
    reporter: Arc<ProgressReporter>,
    cancellation_token: CancellationToken,
}

impl HandlerContext {
    pub fn new(
        task_id: String,
        job_id: String,
        parameters: Payload,
        reporter: Arc<ProgressReporter>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            job_id,
            parameters,
            reporter,
            cancellation_token,
        }
    }

    /// Report progress for this task.
    ///
    /// Fails once the task was revoked; handlers should stop when that happens.
    pub fn report(
        &self,
        percent: i64,
        step: Option<(i64, i64)>,
        message: Option<&str>,
    ) -> JobResult<()> {
        self.reporter
            .report(&self.task_id, percent, step, message)
            .map(|_| ())
    }

    /// Send a custom event to the task's subscribers.
    pub fn emit(&self, event_type: &str, data: JsonValue) -> JobResult<usize> {
        self.reporter.emit(&self.task_id, event_type, data)
    }

    /// Check if the job was revoked or the pool is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, ctx: HandlerContext) -> Result<Payload, HandlerError>;
}
