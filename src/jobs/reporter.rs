//! Progress reporting from handler execution.
//!
//! Each call writes the store first and then publishes to the hub. The two
//! steps are not linked: if publishing is lost the store still holds the
//! truth and clients reconcile by querying it.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::error::{JobError, JobResult};
use super::models::{JobPatch, JobRecord, JobStatus, Payload};
use super::state_machine::{clamp_progress, MAX_PROGRESS};
use super::store::JobStore;
use crate::notifications::{msg_types, NotificationHub};
use crate::server::metrics;

const RESERVED_EVENT_TYPES: [&str; 8] = [
    msg_types::CONNECTED,
    msg_types::PONG,
    msg_types::HEARTBEAT_ACK,
    msg_types::SUBSCRIBED,
    msg_types::UNSUBSCRIBED,
    msg_types::SUBSCRIPTIONS,
    msg_types::ERROR,
    msg_types::TASK_UPDATE,
];

pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, hub: Arc<NotificationHub>) -> Self {
        Self { store, hub }
    }

    fn publish(&self, record: &JobRecord, data: serde_json::Value) {
        self.hub.publish_update(
            &record.id,
            &record.owner_user_id,
            record.status.as_str(),
            record.progress,
            record.message.as_deref(),
            data,
        );
    }

    /// Report progress of a running task. Out of range percentages are clamped.
    pub fn report(
        &self,
        task_id: &str,
        percent: i64,
        step: Option<(i64, i64)>,
        message: Option<&str>,
    ) -> JobResult<JobRecord> {
        let mut patch = JobPatch::status(JobStatus::Progress).with_progress(clamp_progress(percent));
        if let Some((current, total)) = step {
            patch.current_step = Some(current);
            patch.total_steps = Some(total);
        }
        patch.message = message.map(str::to_string);

        let record = self.store.update(task_id, &patch)?;
        debug!("Task {} at {}%", task_id, record.progress);
        self.publish(
            &record,
            json!({"current_step": record.current_step, "total_steps": record.total_steps}),
        );
        Ok(record)
    }

    /// Send a custom event to the task's subscribers without touching the record.
    ///
    /// Reserved message types are refused so an event can never pose as a
    /// status update.
    pub fn emit(&self, task_id: &str, event_type: &str, data: serde_json::Value) -> JobResult<usize> {
        if event_type.is_empty() || RESERVED_EVENT_TYPES.contains(&event_type) {
            return Err(JobError::Validation(format!(
                "'{}' is not a valid event type",
                event_type
            )));
        }
        Ok(self.hub.broadcast_event(task_id, event_type, data))
    }

    /// First report after a worker picks the task up: PROGRESS at 0%.
    pub fn start(&self, task_id: &str, worker_id: &str) -> JobResult<JobRecord> {
        let patch = JobPatch {
            worker_id: Some(Some(worker_id.to_string())),
            ..JobPatch::status(JobStatus::Progress)
                .with_progress(0)
                .with_message("started")
        };
        let record = self.store.update(task_id, &patch)?;
        self.publish(&record, json!({"worker_id": worker_id}));
        Ok(record)
    }

    pub fn complete(&self, task_id: &str, result: Payload) -> JobResult<JobRecord> {
        let patch = JobPatch {
            result: Some(result),
            ..JobPatch::status(JobStatus::Success)
                .with_progress(MAX_PROGRESS)
                .with_message("completed")
        };
        let record = self.store.update(task_id, &patch)?;
        metrics::record_job_finished(&record);
        let data = record
            .result
            .as_ref()
            .map(Payload::to_json)
            .unwrap_or_default();
        self.publish(&record, json!({ "result": data }));
        Ok(record)
    }

    pub fn fail(&self, task_id: &str, error_info: Payload, message: &str) -> JobResult<JobRecord> {
        let patch = JobPatch {
            error_info: Some(error_info),
            ..JobPatch::status(JobStatus::Failure).with_message(message)
        };
        let record = self.store.update(task_id, &patch)?;
        metrics::record_job_finished(&record);
        let data = record
            .error_info
            .as_ref()
            .map(Payload::to_json)
            .unwrap_or_default();
        self.publish(&record, json!({ "error": data }));
        Ok(record)
    }

    /// Handler asked to be run again: PROGRESS -> RETRY, consuming one retry.
    pub fn request_retry(&self, task_id: &str, message: &str) -> JobResult<JobRecord> {
        let current = self.store.get(task_id)?;
        let patch = JobPatch {
            retry_count: Some(current.retry_count + 1),
            ..JobPatch::status(JobStatus::Retry)
                .expecting(current.status)
                .with_progress(0)
                .with_message(message)
        };
        let record = self.store.update(task_id, &patch)?;
        metrics::record_job_retry("handler");
        self.publish(&record, json!({"retry_count": record.retry_count}));
        Ok(record)
    }
}
