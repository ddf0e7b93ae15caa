//! Job orchestration and live task notifications.
//!
//! This library exposes the internal modules for testing and embedding
//! applications that register their own job handlers.

pub mod config;
pub mod jobs;
pub mod notifications;
pub mod server;
pub mod sqlite_persistence;

pub use jobs::{JobStore, SqliteJobStore};
pub use server::{make_app, run_server, JobServices, RequestsLoggingLevel};
