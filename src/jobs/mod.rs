//! Job orchestration: records, lifecycle, dispatch and reporting.

mod controller;
pub mod error;
mod gateway;
pub mod handlers;
pub mod models;
mod query;
pub mod queue;
mod reporter;
mod retention;
mod retry_policy;
mod schema;
pub mod state_machine;
pub(crate) mod store;
pub mod worker;

pub use controller::{BatchOperation, BatchOutcome, RecoveryReport, TaskController};
pub use error::{JobError, JobResult};
pub use gateway::{SubmissionGateway, SubmitRequest};
pub use models::{
    Actor, JobFilter, JobPage, JobPriority, JobRecord, JobStatus, JobType, Payload, SortColumn,
    SortDirection,
};
pub use query::{JobStatistics, QueryService, TaskStatistics, MAX_PAGE_SIZE};
pub use queue::{JobQueue, QueueError, QueueSubmission, QueuedJobInfo, WorkerJobs, WorkerStats};
pub use reporter::ProgressReporter;
pub use retention::RetentionSweep;
pub use retry_policy::RetryPolicy;
pub use store::{JobStore, SqliteJobStore};
