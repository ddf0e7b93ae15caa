//! In-process job execution.

mod handler;
mod pool;

pub use handler::{HandlerContext, HandlerError, JobHandler};
pub use pool::{LocalWorkerPool, WorkerPoolSettings};
