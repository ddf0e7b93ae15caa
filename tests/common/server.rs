//! Test server lifecycle management
//!
//! Each test gets an isolated server with its own job database and worker pool.

use super::constants::*;
use super::handlers::test_handlers;
use jobhub_server::config::JobsSettings;
use jobhub_server::jobs::worker::{LocalWorkerPool, WorkerPoolSettings};
use jobhub_server::jobs::{JobQueue, JobStore, ProgressReporter, RetryPolicy, SqliteJobStore};
use jobhub_server::notifications::NotificationHub;
use jobhub_server::server::{make_app, JobServices, RequestsLoggingLevel, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance with an isolated job database
///
/// When dropped, the server gracefully shuts down and temp resources are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Job store for direct database access in tests
    pub store: Arc<dyn JobStore>,

    // Private fields - keep resources alive until drop
    _pool: Arc<LocalWorkerPool>,
    _temp_db_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port
    ///
    /// # Panics
    ///
    /// Panics if the database cannot be created, the port cannot be bound
    /// or the server doesn't become ready within timeout.
    pub async fn spawn() -> Self {
        let temp_db_dir = TempDir::new().expect("Failed to create temp dir");
        let store: Arc<dyn JobStore> = Arc::new(
            SqliteJobStore::new(temp_db_dir.path().join("jobs.db"))
                .expect("Failed to open job store"),
        );

        // Short delays keep retry scenarios fast.
        let settings = JobsSettings {
            default_retry_delay_secs: 0,
            worker_concurrency: 2,
            shutdown_timeout_secs: 1,
            ..JobsSettings::default()
        };

        let hub = Arc::new(NotificationHub::default());
        let reporter = Arc::new(ProgressReporter::new(store.clone(), hub.clone()));
        let pool = Arc::new(LocalWorkerPool::start(
            WorkerPoolSettings {
                concurrency: settings.worker_concurrency,
                shutdown_timeout: settings.shutdown_timeout(),
            },
            store.clone(),
            reporter,
            RetryPolicy::new(&settings),
            test_handlers(),
        ));
        let queue: Arc<dyn JobQueue> = pool.clone();
        let services = JobServices::new(store.clone(), queue, hub, &settings);

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
            metrics_port: None,
        };
        let app = make_app(config, services).expect("Failed to build app");

        // Spawn server in background task with graceful shutdown
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            store,
            _pool: pool,
            _temp_db_dir: temp_db_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling `/`
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
