//! Job status transitions.
//!
//! ```text
//! PENDING -> PROGRESS -> SUCCESS
//!                     -> FAILURE -> RETRY (while retries remain)
//!            PROGRESS -> RETRY -> PROGRESS
//! any non-terminal    -> REVOKED
//! ```

use super::error::{JobError, JobResult};
use super::models::{JobPatch, JobRecord, JobStatus};

pub const MAX_PROGRESS: u8 = 100;

pub const REASON_ALREADY_COMPLETED: &str = "task already completed";
pub const REASON_RETRIES_EXHAUSTED: &str = "max retries exceeded";

/// Clamp a reported percentage into 0..=100.
pub fn clamp_progress(percent: i64) -> u8 {
    percent.clamp(0, MAX_PROGRESS as i64) as u8
}

fn edge_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    match (from, to) {
        (_, Revoked) => true,
        (Pending, Progress) => true,
        (Progress, Progress | Success | Failure | Retry) => true,
        (Retry, Progress) => true,
        (Failure, Retry) => true,
        _ => false,
    }
}

/// Validate moving `record` into `next`.
pub fn check_transition(record: &JobRecord, next: JobStatus) -> JobResult<()> {
    if record.is_terminal() {
        if next == JobStatus::Retry && record.status == JobStatus::Failure {
            return Err(JobError::InvalidState(REASON_RETRIES_EXHAUSTED.to_string()));
        }
        return Err(JobError::InvalidState(REASON_ALREADY_COMPLETED.to_string()));
    }
    if !edge_allowed(record.status, next) {
        return Err(JobError::transition(record.status, next));
    }
    if next == JobStatus::Retry && record.retries_exhausted() {
        return Err(JobError::InvalidState(REASON_RETRIES_EXHAUSTED.to_string()));
    }
    Ok(())
}

/// Validate a patch that leaves the status untouched.
pub fn check_in_place_update(record: &JobRecord) -> JobResult<()> {
    if record.is_terminal() {
        return Err(JobError::InvalidState(REASON_ALREADY_COMPLETED.to_string()));
    }
    if !record.status.is_active() {
        return Err(JobError::InvalidState(format!(
            "task in status {} only accepts status changes",
            record.status
        )));
    }
    Ok(())
}

/// Validate `patch` against `record` and apply it in place.
///
/// `started_at` is stamped on the first move into PROGRESS and `completed_at`
/// when the record becomes terminal. A FAILURE with retries left is not
/// terminal and leaves `completed_at` unset.
pub fn apply_patch(record: &mut JobRecord, patch: &JobPatch, now: i64) -> JobResult<()> {
    if let Some(expected) = patch.expected_status {
        if record.status != expected {
            return Err(JobError::InvalidState(format!(
                "task is {} (expected {})",
                record.status, expected
            )));
        }
    }
    match patch.status {
        Some(next) => check_transition(record, next)?,
        None => check_in_place_update(record)?,
    }
    if let Some(retry_count) = patch.retry_count {
        if retry_count > record.max_retries {
            return Err(JobError::InvalidState(REASON_RETRIES_EXHAUSTED.to_string()));
        }
        record.retry_count = retry_count;
    }

    if let Some(next) = patch.status {
        record.status = next;
        if next == JobStatus::Progress && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if record.is_terminal() && record.completed_at.is_none() {
            record.completed_at = Some(now);
        }
    }
    if let Some(progress) = patch.progress {
        record.progress = progress.min(MAX_PROGRESS);
    }
    if let Some(step) = patch.current_step {
        record.current_step = Some(step);
    }
    if let Some(total) = patch.total_steps {
        record.total_steps = Some(total);
    }
    if let Some(message) = &patch.message {
        record.message = Some(message.clone());
    }
    if let Some(worker_id) = &patch.worker_id {
        record.worker_id = worker_id.clone();
    }
    if let Some(result) = &patch.result {
        record.result = Some(result.clone());
    }
    if let Some(error_info) = &patch.error_info {
        record.error_info = Some(error_info.clone());
    }
    record.updated_at = now;
    Ok(())
}

/// Whether a user-initiated retry is allowed right now.
pub fn can_retry(record: &JobRecord) -> bool {
    retry_rejection(record).is_none()
}

/// Why a user-initiated retry would be refused, if it would.
pub fn retry_rejection(record: &JobRecord) -> Option<&'static str> {
    match record.status {
        JobStatus::Failure if record.retries_exhausted() => Some(REASON_RETRIES_EXHAUSTED),
        JobStatus::Failure => None,
        JobStatus::Success | JobStatus::Revoked => Some(REASON_ALREADY_COMPLETED),
        _ => Some("task has not failed"),
    }
}

/// Why a cancel would be refused, if it would.
pub fn cancel_rejection(record: &JobRecord) -> Option<&'static str> {
    if record.is_terminal() {
        Some(REASON_ALREADY_COMPLETED)
    } else {
        None
    }
}
