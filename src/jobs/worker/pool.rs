//! Worker pool running registered handlers on tokio tasks.
//!
//! Jobs move through three places while the pool owns them: `scheduled`
//! (waiting on a countdown), `reserved` (sitting in the channel) and `active`
//! (a worker is running the handler). Each submission gets a sequence number
//! so a revoked or superseded entry still sitting in the channel is skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{HandlerContext, HandlerError, JobHandler};
use crate::jobs::error::JobError;
use crate::jobs::queue::{
    JobQueue, QueueError, QueueSubmission, QueuedJobInfo, WorkerJobs, WorkerStats,
};
use crate::jobs::reporter::ProgressReporter;
use crate::jobs::retry_policy::RetryPolicy;
use crate::jobs::store::JobStore;

const POOL_NAME: &str = "local";

#[derive(Debug, Clone)]
pub struct WorkerPoolSettings {
    pub concurrency: usize,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct QueuedJob {
    seq: u64,
    submission: QueueSubmission,
}

struct PendingEntry {
    seq: u64,
    info: QueuedJobInfo,
}

struct ScheduledEntry {
    seq: u64,
    info: QueuedJobInfo,
    timer: CancellationToken,
}

struct ActiveEntry {
    seq: u64,
    info: QueuedJobInfo,
    worker_id: String,
    token: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    next_seq: u64,
    scheduled: HashMap<String, ScheduledEntry>,
    reserved: HashMap<String, PendingEntry>,
    active: HashMap<String, ActiveEntry>,
    stats: HashMap<String, WorkerStats>,
}

enum Outcome {
    Skipped,
    Succeeded,
    Failed,
    Retried(QueueSubmission),
    Revoked,
}

struct PoolInner {
    store: Arc<dyn JobStore>,
    reporter: Arc<ProgressReporter>,
    retry_policy: RetryPolicy,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    sender: mpsc::UnboundedSender<QueuedJob>,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>>;

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(self: &Arc<Self>, submission: QueueSubmission) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        let now = chrono::Utc::now().timestamp();
        let countdown = submission.countdown.filter(|delay| !delay.is_zero());
        let job_id = submission.job_id.clone();
        let info = QueuedJobInfo {
            job_id: job_id.clone(),
            handler_name: submission.handler_name.clone(),
            enqueued_at: now,
            eta: countdown.map(|delay| now + delay.as_secs() as i64),
        };

        let mut state = self.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        // A resubmission supersedes whatever is still waiting under the same id.
        if let Some(previous) = state.scheduled.remove(&job_id) {
            previous.timer.cancel();
        }
        state.reserved.remove(&job_id);

        match countdown {
            None => {
                state.reserved.insert(job_id.clone(), PendingEntry { seq, info });
                drop(state);
                debug!("Job {} reserved", job_id);
                self.dispatch(QueuedJob { seq, submission })
            }
            Some(delay) => {
                let timer = self.shutdown.child_token();
                state.scheduled.insert(
                    job_id.clone(),
                    ScheduledEntry {
                        seq,
                        info,
                        timer: timer.clone(),
                    },
                );
                drop(state);
                debug!("Job {} scheduled in {:?}", job_id, delay);
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => {}
                        _ = tokio::time::sleep(delay) => inner.release_scheduled(seq, submission),
                    }
                });
                Ok(())
            }
        }
    }

    fn dispatch(&self, job: QueuedJob) -> Result<(), QueueError> {
        let job_id = job.submission.job_id.clone();
        if self.sender.send(job).is_err() {
            self.lock().reserved.remove(&job_id);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn release_scheduled(&self, seq: u64, submission: QueueSubmission) {
        let mut state = self.lock();
        let current = state
            .scheduled
            .get(&submission.job_id)
            .map_or(false, |entry| entry.seq == seq);
        if !current {
            return;
        }
        if let Some(entry) = state.scheduled.remove(&submission.job_id) {
            let info = QueuedJobInfo {
                eta: None,
                ..entry.info
            };
            state
                .reserved
                .insert(submission.job_id.clone(), PendingEntry { seq, info });
        }
        drop(state);
        if let Err(e) = self.dispatch(QueuedJob { seq, submission }) {
            warn!("Failed to release scheduled job: {}", e);
        }
    }

    fn revoke(&self, job_id: &str, terminate: bool) {
        let mut state = self.lock();
        if let Some(entry) = state.scheduled.remove(job_id) {
            entry.timer.cancel();
            debug!("Revoked scheduled job {}", job_id);
        }
        if state.reserved.remove(job_id).is_some() {
            debug!("Revoked reserved job {}", job_id);
        }
        if terminate {
            if let Some(entry) = state.active.get(job_id) {
                debug!("Terminating job {} on {}", job_id, entry.worker_id);
                entry.token.cancel();
            }
        }
    }

    fn take_reserved(&self, job: &QueuedJob, worker_id: &str) -> Option<CancellationToken> {
        let job_id = &job.submission.job_id;
        let mut state = self.lock();
        let current = state
            .reserved
            .get(job_id)
            .map_or(false, |entry| entry.seq == job.seq);
        if !current {
            return None;
        }
        let entry = state.reserved.remove(job_id)?;
        let token = self.shutdown.child_token();
        state.active.insert(
            job_id.clone(),
            ActiveEntry {
                seq: job.seq,
                info: entry.info,
                worker_id: worker_id.to_string(),
                token: token.clone(),
            },
        );
        Some(token)
    }

    async fn process(self: &Arc<Self>, worker_id: &str, job: QueuedJob) {
        let Some(token) = self.take_reserved(&job, worker_id) else {
            debug!("Skipping revoked job {}", job.submission.job_id);
            return;
        };
        let outcome = self.execute(worker_id, &job.submission, token).await;
        if let Some(retry) = self.finish(worker_id, &job.submission.job_id, job.seq, outcome) {
            if let Err(e) = self.enqueue(retry) {
                error!("Failed to resubmit job {}: {}", job.submission.job_id, e);
            }
        }
    }

    async fn execute(
        &self,
        worker_id: &str,
        submission: &QueueSubmission,
        token: CancellationToken,
    ) -> Outcome {
        let job_id = &submission.job_id;
        let record = match self.store.find_by_external_id(job_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("No task record for job {}", job_id);
                return Outcome::Skipped;
            }
            Err(e) => {
                error!("Failed to load task for job {}: {}", job_id, e);
                return Outcome::Skipped;
            }
        };
        if let Err(e) = self.reporter.start(&record.id, worker_id) {
            debug!("Not starting task {}: {}", record.id, e);
            return Outcome::Skipped;
        }

        let Some(handler) = self.handlers.get(submission.handler_name.as_str()).cloned() else {
            let err = HandlerError::new(format!(
                "no handler registered for {}",
                submission.handler_name
            ));
            return self.record_failure(&record.id, &err);
        };

        let ctx = HandlerContext::new(
            record.id.clone(),
            job_id.clone(),
            submission.parameters.clone(),
            Arc::clone(&self.reporter),
            token.clone(),
        );
        let started = Instant::now();
        let result = tokio::spawn(async move { handler.run(ctx).await }).await;
        let elapsed = started.elapsed();

        if token.is_cancelled() {
            info!(
                "Task {} was cancelled after {:?}, discarding its outcome",
                record.id, elapsed
            );
            return Outcome::Revoked;
        }

        match result {
            Ok(Ok(payload)) => match self.reporter.complete(&record.id, payload) {
                Ok(_) => {
                    info!("Task {} completed in {:?}", record.id, elapsed);
                    Outcome::Succeeded
                }
                Err(e) => {
                    warn!("Could not complete task {}: {}", record.id, e);
                    Outcome::Skipped
                }
            },
            Ok(Err(err)) if err.retryable => self.retry_or_fail(&record.id, submission, &err),
            Ok(Err(err)) => {
                warn!("Task {} failed after {:?}: {}", record.id, elapsed, err);
                self.record_failure(&record.id, &err)
            }
            Err(join_err) => {
                error!("Handler for task {} panicked: {}", record.id, join_err);
                let err = HandlerError::new(format!("handler panicked: {}", join_err));
                self.record_failure(&record.id, &err)
            }
        }
    }

    fn retry_or_fail(
        &self,
        task_id: &str,
        submission: &QueueSubmission,
        err: &HandlerError,
    ) -> Outcome {
        match self.reporter.request_retry(task_id, &err.message) {
            Ok(record) => {
                let countdown = self.retry_policy.countdown_for(&record);
                info!(
                    "Task {} will retry ({}/{}) in {:?}: {}",
                    task_id, record.retry_count, record.max_retries, countdown, err
                );
                Outcome::Retried(QueueSubmission {
                    countdown,
                    ..submission.clone()
                })
            }
            Err(JobError::InvalidState(reason)) => {
                debug!("Task {} cannot retry: {}", task_id, reason);
                self.record_failure(task_id, err)
            }
            Err(e) => {
                error!("Failed to schedule retry for task {}: {}", task_id, e);
                self.record_failure(task_id, err)
            }
        }
    }

    fn record_failure(&self, task_id: &str, err: &HandlerError) -> Outcome {
        match self.reporter.fail(task_id, err.to_payload(), &err.message) {
            Ok(_) => Outcome::Failed,
            Err(e) => {
                warn!("Could not record failure of task {}: {}", task_id, e);
                Outcome::Skipped
            }
        }
    }

    fn finish(
        &self,
        worker_id: &str,
        job_id: &str,
        seq: u64,
        outcome: Outcome,
    ) -> Option<QueueSubmission> {
        let mut state = self.lock();
        // A resubmission may already be running under the same job id.
        if state.active.get(job_id).map_or(false, |entry| entry.seq == seq) {
            state.active.remove(job_id);
        }
        let stats = state.stats.entry(worker_id.to_string()).or_default();
        stats.processed += 1;
        match outcome {
            Outcome::Skipped => None,
            Outcome::Succeeded => {
                stats.succeeded += 1;
                None
            }
            Outcome::Failed => {
                stats.failed += 1;
                None
            }
            Outcome::Revoked => {
                stats.revoked += 1;
                None
            }
            Outcome::Retried(submission) => {
                stats.retried += 1;
                Some(submission)
            }
        }
    }
}

async fn run_worker(inner: Arc<PoolInner>, worker_id: String, receiver: SharedReceiver) {
    debug!("Worker {} started", worker_id);
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = inner.shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        match next {
            Some(job) => inner.process(&worker_id, job).await,
            None => break,
        }
    }
    debug!("Worker {} stopped", worker_id);
}

/// [`JobQueue`] backed by tokio tasks in this process.
pub struct LocalWorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl LocalWorkerPool {
    /// Spawn the workers. Must be called from within a tokio runtime.
    pub fn start(
        settings: WorkerPoolSettings,
        store: Arc<dyn JobStore>,
        reporter: Arc<ProgressReporter>,
        retry_policy: RetryPolicy,
        handlers: Vec<Arc<dyn JobHandler>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handlers: HashMap<&'static str, Arc<dyn JobHandler>> = handlers
            .into_iter()
            .map(|handler| (handler.job_type().handler_name(), handler))
            .collect();
        let handler_count = handlers.len();

        let inner = Arc::new(PoolInner {
            store,
            reporter,
            retry_policy,
            handlers,
            sender,
            state: Mutex::new(PoolState::default()),
            shutdown: CancellationToken::new(),
        });

        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let concurrency = settings.concurrency.max(1);
        let workers = (1..=concurrency)
            .map(|n| {
                let worker_id = format!("{}-worker-{}", POOL_NAME, n);
                tokio::spawn(run_worker(Arc::clone(&inner), worker_id, Arc::clone(&receiver)))
            })
            .collect();

        info!(
            "Started {} job workers with {} handlers",
            concurrency, handler_count
        );
        Self {
            inner,
            workers: Mutex::new(workers),
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    /// Stop pulling jobs, cancel running handlers and wait for workers to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down job workers...");
        self.inner.shutdown.cancel();
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let joined = tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(workers));
        if joined.await.is_err() {
            warn!(
                "Job workers did not stop within {:?}",
                self.shutdown_timeout
            );
        } else {
            info!("Job workers shutdown complete");
        }
    }

    fn grouped<'a>(entries: impl Iterator<Item = (&'a str, &'a QueuedJobInfo)>) -> WorkerJobs {
        let mut grouped = WorkerJobs::new();
        for (worker, info) in entries {
            grouped.entry(worker.to_string()).or_default().push(info.clone());
        }
        for jobs in grouped.values_mut() {
            jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.job_id.cmp(&b.job_id)));
        }
        grouped
    }
}

#[async_trait]
impl JobQueue for LocalWorkerPool {
    async fn submit(&self, submission: QueueSubmission) -> Result<(), QueueError> {
        self.inner.enqueue(submission)
    }

    async fn revoke(&self, job_id: &str, terminate: bool) -> Result<(), QueueError> {
        self.inner.revoke(job_id, terminate);
        Ok(())
    }

    async fn inspect_active(&self) -> Result<WorkerJobs, QueueError> {
        let state = self.inner.lock();
        Ok(Self::grouped(
            state
                .active
                .values()
                .map(|entry| (entry.worker_id.as_str(), &entry.info)),
        ))
    }

    async fn inspect_scheduled(&self) -> Result<WorkerJobs, QueueError> {
        let state = self.inner.lock();
        Ok(Self::grouped(
            state.scheduled.values().map(|entry| (POOL_NAME, &entry.info)),
        ))
    }

    async fn inspect_reserved(&self) -> Result<WorkerJobs, QueueError> {
        let state = self.inner.lock();
        Ok(Self::grouped(
            state.reserved.values().map(|entry| (POOL_NAME, &entry.info)),
        ))
    }

    async fn stats(&self) -> Result<HashMap<String, WorkerStats>, QueueError> {
        Ok(self.inner.lock().stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::{JobPatch, JobRecord, JobStatus, JobType, Payload};
    use crate::jobs::store::tests::new_job;
    use crate::jobs::store::SqliteJobStore;
    use crate::notifications::NotificationHub;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        fn job_type(&self) -> JobType {
            JobType::Ocr
        }

        async fn run(&self, ctx: HandlerContext) -> Result<Payload, HandlerError> {
            ctx.report(50, Some((1, 2)), Some("halfway"))
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(Payload::from(json!({"echo": ctx.parameters.to_json()})))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        fn job_type(&self) -> JobType {
            JobType::Llm
        }

        async fn run(&self, _ctx: HandlerContext) -> Result<Payload, HandlerError> {
            Err(HandlerError::new("model unavailable").with_details(json!({"code": 503})))
        }
    }

    struct FlakyHandler {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn job_type(&self) -> JobType {
            JobType::KgExtraction
        }

        async fn run(&self, _ctx: HandlerContext) -> Result<Payload, HandlerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(HandlerError::retryable("rate limited"));
            }
            Ok(Payload::from(json!({"entities": 3})))
        }
    }

    struct BlockingHandler;

    #[async_trait]
    impl JobHandler for BlockingHandler {
        fn job_type(&self) -> JobType {
            JobType::Export
        }

        async fn run(&self, ctx: HandlerContext) -> Result<Payload, HandlerError> {
            ctx.cancelled().await;
            Err(HandlerError::new("cancelled"))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        fn job_type(&self) -> JobType {
            JobType::Import
        }

        async fn run(&self, _ctx: HandlerContext) -> Result<Payload, HandlerError> {
            panic!("corrupt input")
        }
    }

    struct Fixture {
        store: Arc<dyn JobStore>,
        pool: LocalWorkerPool,
    }

    fn fixture(flaky_failures: usize) -> Fixture {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let hub = Arc::new(NotificationHub::new(64));
        let reporter = Arc::new(ProgressReporter::new(store.clone(), hub));
        let handlers: Vec<Arc<dyn JobHandler>> = vec![
            Arc::new(EchoHandler),
            Arc::new(FailingHandler),
            Arc::new(FlakyHandler {
                failures_left: AtomicUsize::new(flaky_failures),
            }),
            Arc::new(BlockingHandler),
            Arc::new(PanickingHandler),
        ];
        let pool = LocalWorkerPool::start(
            WorkerPoolSettings {
                concurrency: 2,
                shutdown_timeout: Duration::from_secs(5),
            },
            store.clone(),
            reporter,
            RetryPolicy::default(),
            handlers,
        );
        Fixture { store, pool }
    }

    fn create(store: &Arc<dyn JobStore>, job_type: JobType) -> JobRecord {
        let mut job = new_job("U1", job_type);
        job.retry_delay = 0;
        store.create(job).unwrap()
    }

    fn submission(record: &JobRecord, countdown: Option<Duration>) -> QueueSubmission {
        QueueSubmission {
            job_id: record.external_job_id.clone(),
            handler_name: record.job_type.handler_name().to_string(),
            parameters: record.parameters.clone(),
            countdown,
        }
    }

    async fn wait_for_status(store: &Arc<dyn JobStore>, id: &str, status: JobStatus) -> JobRecord {
        for _ in 0..500 {
            let record = store.get(id).unwrap();
            if record.status == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {}", id, status);
    }

    async fn wait_until_idle(pool: &LocalWorkerPool) {
        for _ in 0..500 {
            if pool.inspect_active().await.unwrap().is_empty()
                && pool.inspect_reserved().await.unwrap().is_empty()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never became idle");
    }

    fn total(stats: &HashMap<String, WorkerStats>) -> WorkerStats {
        stats.values().fold(WorkerStats::default(), |mut acc, s| {
            acc.processed += s.processed;
            acc.succeeded += s.succeeded;
            acc.failed += s.failed;
            acc.retried += s.retried;
            acc.revoked += s.revoked;
            acc
        })
    }

    fn reserve(inner: &PoolInner, record: &JobRecord) -> QueuedJob {
        let submission = submission(record, None);
        let mut state = inner.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.reserved.insert(
            submission.job_id.clone(),
            PendingEntry {
                seq,
                info: QueuedJobInfo {
                    job_id: submission.job_id.clone(),
                    handler_name: submission.handler_name.clone(),
                    enqueued_at: 0,
                    eta: None,
                },
            },
        );
        QueuedJob { seq, submission }
    }

    #[tokio::test]
    async fn finishing_stale_run_keeps_resubmitted_run_active() {
        let f = fixture(0);
        let inner = &f.pool.inner;
        let record = create(&f.store, JobType::Llm);
        let job_id = record.external_job_id.clone();

        let first = reserve(inner, &record);
        let first_token = inner.take_reserved(&first, "local-worker-1").unwrap();
        let second = reserve(inner, &record);
        let second_token = inner.take_reserved(&second, "local-worker-2").unwrap();

        assert!(inner
            .finish("local-worker-1", &job_id, first.seq, Outcome::Failed)
            .is_none());
        let active = f.pool.inspect_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active["local-worker-2"][0].job_id, job_id);

        inner.revoke(&job_id, true);
        assert!(second_token.is_cancelled());
        assert!(!first_token.is_cancelled());

        inner.finish("local-worker-2", &job_id, second.seq, Outcome::Revoked);
        assert!(f.pool.inspect_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_handler_to_success() {
        let f = fixture(0);
        let record = create(&f.store, JobType::Ocr);
        f.pool.submit(submission(&record, None)).await.unwrap();

        let done = wait_for_status(&f.store, &record.id, JobStatus::Success).await;
        assert_eq!(done.progress, 100);
        assert!(done.worker_id.unwrap().starts_with("local-worker-"));
        assert_eq!(
            done.result.unwrap().to_json(),
            json!({"echo": {"document_id": "doc-1"}})
        );
        wait_until_idle(&f.pool).await;
        assert_eq!(total(&f.pool.stats().await.unwrap()).succeeded, 1);
    }

    #[tokio::test]
    async fn handler_error_becomes_failure() {
        let f = fixture(0);
        let record = create(&f.store, JobType::Llm);
        f.pool.submit(submission(&record, None)).await.unwrap();

        let failed = wait_for_status(&f.store, &record.id, JobStatus::Failure).await;
        assert_eq!(failed.message.as_deref(), Some("model unavailable"));
        assert_eq!(
            failed.error_info.unwrap().to_json(),
            json!({"message": "model unavailable", "details": {"code": 503}})
        );
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn retryable_error_is_resubmitted() {
        let f = fixture(2);
        let record = create(&f.store, JobType::KgExtraction);
        f.pool.submit(submission(&record, None)).await.unwrap();

        let done = wait_for_status(&f.store, &record.id, JobStatus::Success).await;
        assert_eq!(done.retry_count, 2);
        wait_until_idle(&f.pool).await;
        let stats = total(&f.pool.stats().await.unwrap());
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn retryable_error_fails_once_budget_is_spent() {
        let f = fixture(10);
        let record = create(&f.store, JobType::KgExtraction);
        f.pool.submit(submission(&record, None)).await.unwrap();

        let failed = wait_for_status(&f.store, &record.id, JobStatus::Failure).await;
        assert_eq!(failed.retry_count, failed.max_retries);
        assert!(failed.is_terminal());
    }

    #[tokio::test]
    async fn panicking_handler_fails_task_but_not_worker() {
        let f = fixture(0);
        let broken = create(&f.store, JobType::Import);
        f.pool.submit(submission(&broken, None)).await.unwrap();
        let failed = wait_for_status(&f.store, &broken.id, JobStatus::Failure).await;
        assert!(failed.message.unwrap().starts_with("handler panicked"));

        let fine = create(&f.store, JobType::Ocr);
        f.pool.submit(submission(&fine, None)).await.unwrap();
        wait_for_status(&f.store, &fine.id, JobStatus::Success).await;
    }

    #[tokio::test]
    async fn missing_handler_fails_task() {
        let f = fixture(0);
        let record = create(&f.store, JobType::FileProcessing);
        f.pool.submit(submission(&record, None)).await.unwrap();

        let failed = wait_for_status(&f.store, &record.id, JobStatus::Failure).await;
        assert_eq!(
            failed.message.as_deref(),
            Some("no handler registered for files.process")
        );
    }

    #[tokio::test]
    async fn revoke_terminates_running_handler() {
        let f = fixture(0);
        let record = create(&f.store, JobType::Export);
        f.pool.submit(submission(&record, None)).await.unwrap();
        wait_for_status(&f.store, &record.id, JobStatus::Progress).await;
        assert_eq!(f.pool.inspect_active().await.unwrap().len(), 1);

        f.store
            .update(&record.id, &JobPatch::status(JobStatus::Revoked))
            .unwrap();
        f.pool.revoke(&record.external_job_id, true).await.unwrap();

        wait_until_idle(&f.pool).await;
        assert_eq!(f.store.get(&record.id).unwrap().status, JobStatus::Revoked);
        assert_eq!(total(&f.pool.stats().await.unwrap()).revoked, 1);
    }

    #[tokio::test]
    async fn countdown_jobs_wait_in_schedule_until_revoked() {
        let f = fixture(0);
        let record = create(&f.store, JobType::Ocr);
        f.pool
            .submit(submission(&record, Some(Duration::from_secs(600))))
            .await
            .unwrap();

        let scheduled = f.pool.inspect_scheduled().await.unwrap();
        let jobs = &scheduled[POOL_NAME];
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, record.external_job_id);
        assert!(jobs[0].eta.unwrap() >= jobs[0].enqueued_at + 600);

        f.pool.revoke(&record.external_job_id, false).await.unwrap();
        assert!(f.pool.inspect_scheduled().await.unwrap().is_empty());
        assert_eq!(f.store.get(&record.id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn short_countdown_eventually_runs() {
        let f = fixture(0);
        let record = create(&f.store, JobType::Ocr);
        f.pool
            .submit(submission(&record, Some(Duration::from_millis(50))))
            .await
            .unwrap();
        wait_for_status(&f.store, &record.id, JobStatus::Success).await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let f = fixture(0);
        f.pool.shutdown().await;
        let record = create(&f.store, JobType::Ocr);
        assert_eq!(
            f.pool.submit(submission(&record, None)).await,
            Err(QueueError::Closed)
        );
    }
}
