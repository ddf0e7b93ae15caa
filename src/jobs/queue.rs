//! Dispatch boundary between job records and whatever executes them.

use super::models::Payload;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("job queue is shut down")]
    Closed,
    #[error("job queue did not answer within {0:?}")]
    Timeout(Duration),
    #[error("job queue rejected the request: {0}")]
    Rejected(String),
}

/// A unit of work handed to the queue.
#[derive(Debug, Clone)]
pub struct QueueSubmission {
    /// The record's `external_job_id`.
    pub job_id: String,
    pub handler_name: String,
    pub parameters: Payload,
    /// Delay before the job becomes eligible to run.
    pub countdown: Option<Duration>,
}

/// A job as seen by the queue when inspected.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueuedJobInfo {
    pub job_id: String,
    pub handler_name: String,
    pub enqueued_at: i64,
    /// Unix time the job becomes eligible, for scheduled jobs.
    pub eta: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub revoked: u64,
}

/// Jobs grouped by the worker (or pool) holding them.
pub type WorkerJobs = HashMap<String, Vec<QueuedJobInfo>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a handler invocation. Must not wait for the job to run.
    async fn submit(&self, submission: QueueSubmission) -> Result<(), QueueError>;

    /// Drop a queued job. With `terminate`, also signal a running one to stop.
    async fn revoke(&self, job_id: &str, terminate: bool) -> Result<(), QueueError>;

    /// Jobs currently executing.
    async fn inspect_active(&self) -> Result<WorkerJobs, QueueError>;

    /// Jobs waiting for their countdown to elapse.
    async fn inspect_scheduled(&self) -> Result<WorkerJobs, QueueError>;

    /// Jobs ready to run but not yet picked up.
    async fn inspect_reserved(&self) -> Result<WorkerJobs, QueueError>;

    async fn stats(&self) -> Result<HashMap<String, WorkerStats>, QueueError>;
}
