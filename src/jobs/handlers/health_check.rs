//! Built-in `HEALTH_CHECK` job: exercises the store end to end.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::jobs::models::{JobFilter, JobType, Payload};
use crate::jobs::store::JobStore;
use crate::jobs::worker::{HandlerContext, HandlerError, JobHandler};

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    task_found: bool,
    total_tasks: usize,
    store_latency_ms: u128,
}

pub struct HealthCheckHandler {
    store: Arc<dyn JobStore>,
}

impl HealthCheckHandler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    fn job_type(&self) -> JobType {
        JobType::HealthCheck
    }

    async fn run(&self, ctx: HandlerContext) -> Result<Payload, HandlerError> {
        let started = Instant::now();
        let store_error = |e: crate::jobs::error::JobError| {
            HandlerError::retryable("store unavailable")
                .with_details(json!({ "error": e.to_string() }))
        };

        let own = self.store.get(&ctx.task_id).map_err(store_error)?;
        ctx.report(50, Some((1, 2)), Some("store read ok"))
            .map_err(|e| HandlerError::new(e.to_string()))?;

        if ctx.is_cancelled() {
            return Err(HandlerError::new("cancelled"));
        }
        let filter = JobFilter {
            limit: 1,
            ..Default::default()
        };
        let page = self.store.list(&filter).map_err(store_error)?;
        ctx.report(100, Some((2, 2)), Some("store query ok"))
            .map_err(|e| HandlerError::new(e.to_string()))?;

        Payload::encode(&HealthReport {
            status: "ok",
            task_found: own.id == ctx.task_id,
            total_tasks: page.total,
            store_latency_ms: started.elapsed().as_millis(),
        })
        .map_err(HandlerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::JobStatus;
    use crate::jobs::reporter::ProgressReporter;
    use crate::jobs::store::tests::new_job;
    use crate::jobs::store::SqliteJobStore;
    use crate::notifications::NotificationHub;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn reports_progress_and_store_figures() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let reporter = Arc::new(ProgressReporter::new(
            store.clone(),
            Arc::new(NotificationHub::default()),
        ));
        let record = store.create(new_job("ops", JobType::HealthCheck)).unwrap();
        reporter.start(&record.id, "w").unwrap();

        let ctx = HandlerContext::new(
            record.id.clone(),
            record.external_job_id.clone(),
            Payload::default(),
            reporter,
            CancellationToken::new(),
        );
        let result = HealthCheckHandler::new(store.clone()).run(ctx).await.unwrap();

        let report = result.to_json();
        assert_eq!(report["status"], "ok");
        assert_eq!(report["task_found"], true);
        assert_eq!(report["total_tasks"], 1);

        let after = store.get(&record.id).unwrap();
        assert_eq!(after.status, JobStatus::Progress);
        assert_eq!(after.progress, 100);
        assert_eq!(after.current_step, Some(2));
    }
}
