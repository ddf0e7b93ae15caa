//! Read side: listings and statistics over the job store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::error::{JobError, JobResult};
use super::models::{Actor, JobFilter, JobPage, JobPriority, JobRecord, JobStatus, JobType};
use super::state_machine::can_retry;
use super::store::JobStore;

pub const MAX_PAGE_SIZE: usize = 500;

const SECONDS_PER_DAY: i64 = 86_400;

/// Aggregate figures over a set of tasks.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStatistics {
    pub total: usize,
    /// PENDING, PROGRESS or RETRY.
    pub active: usize,
    /// SUCCESS or FAILURE.
    pub completed: usize,
    pub failed: usize,
    pub success_rate: f64,
    /// Mean of `completed_at - started_at` in seconds, 0 when nothing ran.
    pub average_duration: f64,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
}

/// Timing and retry figures for one task.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskStatistics {
    pub task_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub can_retry: bool,
    pub queued_secs: Option<i64>,
    pub run_secs: Option<i64>,
    pub actual_duration: Option<i64>,
    pub estimated_duration: Option<i64>,
    pub estimated_remaining_secs: Option<i64>,
}

pub struct QueryService {
    store: Arc<dyn JobStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// List tasks visible to `actor`. Non-admins only ever see their own.
    pub fn list(&self, actor: &Actor, mut filter: JobFilter) -> JobResult<JobPage> {
        if !actor.is_admin {
            filter.owner_user_id = Some(actor.user_id.clone());
        }
        filter.limit = filter.limit.clamp(1, MAX_PAGE_SIZE);
        self.store.list(&filter)
    }

    /// Fetch a task the actor may manage.
    pub fn get_for(&self, actor: &Actor, task_id: &str) -> JobResult<JobRecord> {
        let record = self.store.get(task_id)?;
        if !record.is_manageable_by(actor) {
            return Err(JobError::Permission(format!(
                "task {} belongs to another user",
                task_id
            )));
        }
        Ok(record)
    }

    /// Statistics over tasks created in the last `days` days (all time when
    /// `None` or 0), optionally scoped to one owner.
    pub fn statistics(
        &self,
        owner_user_id: Option<&str>,
        days: Option<u32>,
    ) -> JobResult<JobStatistics> {
        let since = days
            .filter(|days| *days > 0)
            .map(|days| chrono::Utc::now().timestamp() - i64::from(days) * SECONDS_PER_DAY);
        let aggregates = self.store.aggregate(owner_user_id, since)?;

        let mut by_status: BTreeMap<String, usize> = JobStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut total = 0;
        let mut active = 0;
        let mut succeeded = 0;
        let mut failed = 0;
        for (status, count) in &aggregates.by_status {
            by_status.insert(status.as_str().to_string(), *count);
            total += count;
            match status {
                JobStatus::Pending | JobStatus::Progress | JobStatus::Retry => active += count,
                JobStatus::Success => succeeded += count,
                JobStatus::Failure => failed += count,
                JobStatus::Revoked => {}
            }
        }

        let mut by_type: BTreeMap<String, usize> = JobType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), 0))
            .collect();
        for (job_type, count) in &aggregates.by_type {
            by_type.insert(job_type.as_str().to_string(), *count);
        }

        let mut by_priority: BTreeMap<String, usize> = JobPriority::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), 0))
            .collect();
        for (priority, count) in &aggregates.by_priority {
            by_priority.insert(priority.as_str().to_string(), *count);
        }

        let completed = succeeded + failed;
        let success_rate = if completed == 0 {
            0.0
        } else {
            succeeded as f64 / completed as f64
        };

        Ok(JobStatistics {
            total,
            active,
            completed,
            failed,
            success_rate,
            average_duration: aggregates.average_duration.unwrap_or(0.0),
            by_type,
            by_status,
            by_priority,
        })
    }

    pub fn task_statistics(&self, actor: &Actor, task_id: &str) -> JobResult<TaskStatistics> {
        let record = self.get_for(actor, task_id)?;
        Ok(Self::task_figures(&record, chrono::Utc::now().timestamp()))
    }

    fn task_figures(record: &JobRecord, now: i64) -> TaskStatistics {
        let queued_secs = record
            .started_at
            .map(|started| (started - record.created_at).max(0));
        // A FAILURE awaiting retry stopped running when it was last updated.
        let stopped_at = match record.status {
            _ if record.completed_at.is_some() => record.completed_at,
            JobStatus::Failure => Some(record.updated_at),
            _ => None,
        };
        let run_secs = record
            .started_at
            .map(|started| (stopped_at.unwrap_or(now) - started).max(0));
        let estimated_remaining_secs = match (record.estimated_duration, run_secs) {
            (Some(estimate), Some(ran)) if record.status.is_active() => {
                Some((estimate - ran).max(0))
            }
            (Some(estimate), None) if record.status.is_active() => Some(estimate),
            _ => None,
        };
        TaskStatistics {
            task_id: record.id.clone(),
            status: record.status,
            progress: record.progress,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            can_retry: can_retry(record),
            queued_secs,
            run_secs,
            actual_duration: record.actual_duration(),
            estimated_duration: record.estimated_duration,
            estimated_remaining_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::JobPatch;
    use crate::jobs::store::tests::new_job;
    use crate::jobs::store::SqliteJobStore;

    fn service() -> (Arc<dyn JobStore>, QueryService) {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        (store.clone(), QueryService::new(store))
    }

    fn move_to(store: &Arc<dyn JobStore>, id: &str, statuses: &[JobStatus]) {
        for status in statuses {
            store.update(id, &JobPatch::status(*status)).unwrap();
        }
    }

    #[test]
    fn list_pages_report_full_total() {
        let (store, service) = service();
        for _ in 0..3 {
            store.create(new_job("U1", JobType::Ocr)).unwrap();
        }
        let running = store.create(new_job("U1", JobType::Llm)).unwrap();
        move_to(&store, &running.id, &[JobStatus::Progress]);
        let done = store.create(new_job("U1", JobType::Llm)).unwrap();
        move_to(&store, &done.id, &[JobStatus::Progress, JobStatus::Success]);
        store.create(new_job("U2", JobType::Ocr)).unwrap();

        let filter = JobFilter {
            statuses: vec![JobStatus::Pending, JobStatus::Progress],
            owner_user_id: Some("U1".to_string()),
            limit: 2,
            ..Default::default()
        };
        let page = service.list(&Actor::admin("root"), filter).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 4);
        assert!(page
            .items
            .iter()
            .all(|r| r.owner_user_id == "U1" && r.status.is_active()));
    }

    #[test]
    fn non_admin_listing_is_pinned_to_self() {
        let (store, service) = service();
        store.create(new_job("U1", JobType::Ocr)).unwrap();
        store.create(new_job("U2", JobType::Ocr)).unwrap();

        let filter = JobFilter {
            owner_user_id: Some("U2".to_string()),
            ..Default::default()
        };
        let page = service.list(&Actor::user("U1"), filter).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].owner_user_id, "U1");
    }

    #[test]
    fn get_for_checks_ownership() {
        let (store, service) = service();
        let record = store.create(new_job("U1", JobType::Ocr)).unwrap();

        assert!(service.get_for(&Actor::user("U1"), &record.id).is_ok());
        assert!(service.get_for(&Actor::admin("ops"), &record.id).is_ok());
        assert!(matches!(
            service.get_for(&Actor::user("U2"), &record.id),
            Err(JobError::Permission(_))
        ));
        assert!(matches!(
            service.get_for(&Actor::user("U1"), "missing"),
            Err(JobError::NotFound(_))
        ));
    }

    #[test]
    fn statistics_on_empty_store_are_zero() {
        let (_store, service) = service();
        let stats = service.statistics(None, Some(7)).unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_duration, 0.0);
        assert_eq!(stats.by_status["PENDING"], 0);
        assert_eq!(stats.by_type["HEALTH_CHECK"], 0);
        assert_eq!(stats.by_priority["critical"], 0);
    }

    #[test]
    fn statistics_count_outcomes() {
        let (store, service) = service();
        let ok = store.create(new_job("U1", JobType::Ocr)).unwrap();
        move_to(&store, &ok.id, &[JobStatus::Progress, JobStatus::Success]);
        let ok2 = store.create(new_job("U1", JobType::Ocr)).unwrap();
        move_to(&store, &ok2.id, &[JobStatus::Progress, JobStatus::Success]);
        let bad = store.create(new_job("U1", JobType::Llm)).unwrap();
        move_to(&store, &bad.id, &[JobStatus::Progress, JobStatus::Failure]);
        let cancelled = store.create(new_job("U1", JobType::Llm)).unwrap();
        move_to(&store, &cancelled.id, &[JobStatus::Revoked]);
        store.create(new_job("U1", JobType::KgExtraction)).unwrap();
        store.create(new_job("U2", JobType::KgExtraction)).unwrap();

        let stats = service.statistics(Some("U1"), None).unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_type["OCR"], 2);
        assert_eq!(stats.by_type["LLM"], 2);
        assert_eq!(stats.by_status["REVOKED"], 1);
        assert_eq!(stats.by_priority["normal"], 5);

        assert_eq!(service.statistics(None, None).unwrap().total, 6);
    }

    #[test]
    fn task_figures_for_running_task() {
        let (store, _service) = service();
        let record = store.create(new_job("U1", JobType::Ocr)).unwrap();
        move_to(&store, &record.id, &[JobStatus::Progress]);
        let mut record = store.get(&record.id).unwrap();
        record.created_at = 1_000;
        record.started_at = Some(1_010);
        record.estimated_duration = Some(30);

        let figures = QueryService::task_figures(&record, 1_020);
        assert_eq!(figures.queued_secs, Some(10));
        assert_eq!(figures.run_secs, Some(10));
        assert_eq!(figures.estimated_remaining_secs, Some(20));
        assert_eq!(figures.actual_duration, None);
        assert!(!figures.can_retry);
    }

    #[test]
    fn task_figures_for_failed_task() {
        let (store, service) = service();
        let record = store.create(new_job("U1", JobType::Ocr)).unwrap();
        move_to(&store, &record.id, &[JobStatus::Progress, JobStatus::Failure]);

        let figures = service.task_statistics(&Actor::user("U1"), &record.id).unwrap();
        assert_eq!(figures.status, JobStatus::Failure);
        assert!(figures.can_retry);
        assert_eq!(figures.estimated_remaining_secs, None);
        assert_eq!(figures.actual_duration, None);
        assert!(figures.run_secs.is_some());
    }

    #[test]
    fn task_figures_for_retried_task_running_again() {
        let (store, _service) = service();
        let record = store.create(new_job("U1", JobType::Ocr)).unwrap();
        move_to(&store, &record.id, &[JobStatus::Progress, JobStatus::Failure]);
        store
            .update(
                &record.id,
                &JobPatch {
                    retry_count: Some(1),
                    ..JobPatch::status(JobStatus::Retry)
                },
            )
            .unwrap();
        move_to(&store, &record.id, &[JobStatus::Progress]);

        let mut record = store.get(&record.id).unwrap();
        assert_eq!(record.completed_at, None);
        record.created_at = 1_000;
        record.started_at = Some(1_010);
        record.estimated_duration = Some(60);

        let figures = QueryService::task_figures(&record, 1_050);
        assert_eq!(figures.run_secs, Some(40));
        assert_eq!(figures.estimated_remaining_secs, Some(20));
        assert_eq!(figures.actual_duration, None);
    }
}
