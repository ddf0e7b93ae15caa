//! Retry and cancellation of tasks.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::error::{JobError, JobResult};
use super::models::{Actor, JobPatch, JobRecord, JobStatus};
use super::queue::{JobQueue, QueueError, QueueSubmission};
use super::retry_policy::RetryPolicy;
use super::state_machine::{cancel_rejection, retry_rejection};
use super::store::JobStore;
use crate::notifications::NotificationHub;
use crate::server::metrics;

/// Message recorded on tasks found mid-run at startup.
pub const WORKER_LOST_MESSAGE: &str = "worker lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperation {
    Cancel,
    Retry,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchOutcome {
    pub task_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What startup reconciliation did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

pub struct TaskController {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    hub: Arc<NotificationHub>,
    retry_policy: RetryPolicy,
    revoke_timeout: Duration,
}

impl TaskController {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        hub: Arc<NotificationHub>,
        retry_policy: RetryPolicy,
        revoke_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            hub,
            retry_policy,
            revoke_timeout,
        }
    }

    fn publish(&self, record: &JobRecord) {
        self.hub.publish_update(
            &record.id,
            &record.owner_user_id,
            record.status.as_str(),
            record.progress,
            record.message.as_deref(),
            json!({"retry_count": record.retry_count, "max_retries": record.max_retries}),
        );
    }

    fn submission_for(record: &JobRecord, countdown: Option<Duration>) -> QueueSubmission {
        QueueSubmission {
            job_id: record.external_job_id.clone(),
            handler_name: record.job_type.handler_name().to_string(),
            parameters: record.parameters.clone(),
            countdown,
        }
    }

    /// Move a failed task back to RETRY and resubmit it under the same job id.
    ///
    /// A rejected retry leaves the record untouched. If the queue refuses the
    /// resubmission the record stays in RETRY and `Transport` is returned.
    pub async fn retry(&self, task_id: &str, reason: Option<&str>) -> JobResult<JobRecord> {
        let record = self.store.get(task_id)?;
        if let Some(rejection) = retry_rejection(&record) {
            debug!("Refusing retry of task {}: {}", task_id, rejection);
            return Err(JobError::InvalidState(rejection.to_string()));
        }

        let message = match reason {
            Some(reason) if !reason.is_empty() => format!("retry requested: {}", reason),
            _ => "retry requested".to_string(),
        };
        let patch = JobPatch {
            retry_count: Some(record.retry_count + 1),
            worker_id: Some(None),
            ..JobPatch::status(JobStatus::Retry)
                .expecting(JobStatus::Failure)
                .with_progress(0)
                .with_message(message)
        };
        let updated = self.store.update(task_id, &patch)?;
        metrics::record_job_retry("manual");
        info!(
            "Task {} retry {}/{}",
            task_id, updated.retry_count, updated.max_retries
        );
        self.publish(&updated);

        let countdown = self.retry_policy.countdown_for(&updated);
        if let Err(e) = self.queue.submit(Self::submission_for(&updated, countdown)).await {
            error!("Failed to resubmit task {}: {}", task_id, e);
            return Err(JobError::Transport(e));
        }
        Ok(updated)
    }

    /// Mark a task REVOKED and ask the queue to terminate it.
    ///
    /// The record is updated first; the terminate request is best-effort and
    /// bounded by the revoke timeout.
    pub async fn cancel(&self, task_id: &str, reason: Option<&str>) -> JobResult<JobRecord> {
        let record = self.store.get(task_id)?;
        if let Some(rejection) = cancel_rejection(&record) {
            return Err(JobError::InvalidState(rejection.to_string()));
        }

        let message = match reason {
            Some(reason) if !reason.is_empty() => format!("cancelled: {}", reason),
            _ => "cancelled".to_string(),
        };
        let revoked = self.store.update(
            task_id,
            &JobPatch::status(JobStatus::Revoked).with_message(message),
        )?;
        metrics::record_job_cancelled();
        metrics::record_job_finished(&revoked);
        info!("Task {} cancelled (was {})", task_id, record.status);
        self.publish(&revoked);

        let terminate = self.queue.revoke(&revoked.external_job_id, true);
        let outcome = match tokio::time::timeout(self.revoke_timeout, terminate).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(self.revoke_timeout)),
        };
        if let Err(e) = outcome {
            metrics::record_revoke_failure();
            warn!("Terminate request for task {} failed: {}", task_id, e);
        }
        Ok(revoked)
    }

    /// Apply `operation` to each task the actor may manage. One bad id never
    /// fails the others.
    pub async fn batch(
        &self,
        operation: BatchOperation,
        task_ids: &[String],
        reason: Option<&str>,
        actor: &Actor,
    ) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let result = self.batch_item(operation, task_id, reason, actor).await;
            outcomes.push(match result {
                Ok(_) => BatchOutcome {
                    task_id: task_id.clone(),
                    success: true,
                    error: None,
                },
                Err(e) => BatchOutcome {
                    task_id: task_id.clone(),
                    success: false,
                    error: Some(e.to_string()),
                },
            });
        }
        outcomes
    }

    async fn batch_item(
        &self,
        operation: BatchOperation,
        task_id: &str,
        reason: Option<&str>,
        actor: &Actor,
    ) -> JobResult<JobRecord> {
        let record = self.store.get(task_id)?;
        if !record.is_manageable_by(actor) {
            return Err(JobError::Permission(format!(
                "task {} belongs to another user",
                task_id
            )));
        }
        match operation {
            BatchOperation::Cancel => self.cancel(task_id, reason).await,
            BatchOperation::Retry => self.retry(task_id, reason).await,
        }
    }

    /// Reconcile tasks left unfinished by a previous process.
    ///
    /// Queued tasks are submitted again under their job id. Tasks that were
    /// running lost their worker and are failed, which keeps them retryable.
    /// A task the queue refuses is left as it is and picked up next start.
    pub async fn recover_interrupted(&self) -> JobResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for record in self.store.list_unfinished()? {
            match record.status {
                JobStatus::Pending | JobStatus::Retry => {
                    let countdown = match record.status {
                        JobStatus::Retry => self.retry_policy.countdown_for(&record),
                        _ => None,
                    };
                    match self
                        .queue
                        .submit(Self::submission_for(&record, countdown))
                        .await
                    {
                        Ok(()) => report.requeued += 1,
                        Err(e) => warn!("Could not requeue interrupted task {}: {}", record.id, e),
                    }
                }
                JobStatus::Progress => {
                    let patch = JobPatch::status(JobStatus::Failure)
                        .expecting(JobStatus::Progress)
                        .with_message(WORKER_LOST_MESSAGE);
                    match self.store.update(&record.id, &patch) {
                        Ok(failed) => {
                            metrics::record_job_finished(&failed);
                            report.failed += 1;
                        }
                        Err(e) => warn!("Could not fail interrupted task {}: {}", record.id, e),
                    }
                }
                _ => {}
            }
        }
        if report != RecoveryReport::default() {
            info!(
                "Recovered interrupted tasks: {} requeued, {} failed",
                report.requeued, report.failed
            );
        }
        Ok(report)
    }
}
