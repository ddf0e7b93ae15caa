//! Task submission: create the record, then hand the job to the queue.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info};

use super::error::{JobError, JobResult};
use super::models::{JobPatch, JobPriority, JobRecord, JobStatus, JobType, NewJob, Payload};
use super::queue::{JobQueue, QueueSubmission};
use super::store::JobStore;
use crate::config::JobsSettings;
use crate::server::metrics;

const MAX_NAME_LEN: usize = 255;
const MAX_TAGS: usize = 32;

/// A request to run a job. Unset fields take their defaults from settings
/// or the job type.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Payload,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default)]
    pub estimated_duration: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<i64>,
}

impl SubmitRequest {
    pub fn new(job_type: JobType, parameters: Payload) -> Self {
        Self {
            job_type,
            name: None,
            parameters,
            priority: JobPriority::default(),
            queue: None,
            tags: Vec::new(),
            is_critical: false,
            estimated_duration: None,
            max_retries: None,
            retry_delay: None,
        }
    }
}

pub struct SubmissionGateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    settings: JobsSettings,
}

impl SubmissionGateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, settings: JobsSettings) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    fn validate(&self, owner_user_id: &str, request: &SubmitRequest) -> JobResult<()> {
        if owner_user_id.trim().is_empty() {
            return Err(JobError::Validation("owner is required".to_string()));
        }
        if let Some(name) = &request.name {
            if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
                return Err(JobError::Validation(format!(
                    "name must be 1 to {} characters",
                    MAX_NAME_LEN
                )));
            }
        }
        if request.parameters.len() > self.settings.max_parameters_bytes {
            return Err(JobError::Validation(format!(
                "parameters exceed {} bytes",
                self.settings.max_parameters_bytes
            )));
        }
        if request.tags.len() > MAX_TAGS || request.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(JobError::Validation(format!(
                "at most {} non-empty tags are allowed",
                MAX_TAGS
            )));
        }
        if let Some(queue) = &request.queue {
            if queue.trim().is_empty() {
                return Err(JobError::Validation("queue must not be empty".to_string()));
            }
        }
        if request.estimated_duration.map_or(false, |d| d < 0)
            || request.retry_delay.map_or(false, |d| d < 0)
        {
            return Err(JobError::Validation("durations must not be negative".to_string()));
        }
        Ok(())
    }

    /// Create a PENDING record for `owner_user_id` and enqueue it.
    ///
    /// Never waits for the job to run. If the queue refuses the job the
    /// record is revoked so it does not linger as PENDING.
    pub async fn submit(
        &self,
        owner_user_id: &str,
        request: SubmitRequest,
    ) -> JobResult<JobRecord> {
        self.validate(owner_user_id, &request)?;

        let job_type = request.job_type;
        let mut tags = request.tags;
        tags.sort();
        tags.dedup();
        let new_job = NewJob {
            id: uuid::Uuid::new_v4().to_string(),
            external_job_id: uuid::Uuid::new_v4().to_string(),
            name: request
                .name
                .unwrap_or_else(|| job_type.display_name().to_string()),
            job_type,
            priority: request.priority,
            owner_user_id: owner_user_id.to_string(),
            queue_name: request
                .queue
                .unwrap_or_else(|| job_type.default_queue().to_string()),
            parameters: request.parameters,
            estimated_duration: request.estimated_duration,
            max_retries: request
                .max_retries
                .unwrap_or(self.settings.default_max_retries),
            retry_delay: request
                .retry_delay
                .unwrap_or(self.settings.default_retry_delay_secs),
            tags,
            is_critical: request.is_critical,
        };
        let record = self.store.create(new_job)?;

        let submission = QueueSubmission {
            job_id: record.external_job_id.clone(),
            handler_name: job_type.handler_name().to_string(),
            parameters: record.parameters.clone(),
            countdown: None,
        };
        if let Err(e) = self.queue.submit(submission).await {
            error!("Failed to enqueue task {}: {}", record.id, e);
            let patch = JobPatch::status(JobStatus::Revoked).with_message("enqueue failed");
            if let Err(revoke_err) = self.store.update(&record.id, &patch) {
                error!("Failed to revoke unqueued task {}: {}", record.id, revoke_err);
            }
            return Err(JobError::Transport(e));
        }

        metrics::record_job_submitted(job_type.as_str());
        info!(
            "Submitted {} task {} for {} on queue {}",
            job_type.as_str(),
            record.id,
            owner_user_id,
            record.queue_name
        );
        Ok(record)
    }
}
