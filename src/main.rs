use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::{fmt::Debug, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobhub_server::config::{AppConfig, CliConfig, FileConfig};
use jobhub_server::jobs::handlers::HealthCheckHandler;
use jobhub_server::jobs::worker::{JobHandler, LocalWorkerPool, WorkerPoolSettings};
use jobhub_server::jobs::{
    JobQueue, JobStore, ProgressReporter, RetentionSweep, RetryPolicy, SqliteJobStore,
};
use jobhub_server::notifications::NotificationHub;
use jobhub_server::server::{self, metrics, run_server, JobServices, RequestsLoggingLevel};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML configuration file. Its values override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the job database (jobs.db).
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Number of concurrent job workers.
    #[clap(long)]
    pub workers: Option<usize>,

    /// Days to keep finished tasks before purging them. Set to 0 to disable the sweep.
    #[clap(long, default_value_t = 30)]
    pub retention_days: u64,

    /// Interval in hours between retention sweeps.
    #[clap(long, default_value_t = 24)]
    pub sweep_interval_hours: u64,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            logging_level: self.logging_level.clone(),
            workers: self.workers,
            retention_days: self.retention_days,
            sweep_interval_hours: self.sweep_interval_hours,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening job database at {:?}...", app_config.jobs_db_path());
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(app_config.jobs_db_path())?);
    let hub = Arc::new(NotificationHub::new(app_config.hub.connection_buffer));
    let reporter = Arc::new(ProgressReporter::new(store.clone(), hub.clone()));

    let handlers: Vec<Arc<dyn JobHandler>> = vec![Arc::new(HealthCheckHandler::new(store.clone()))];
    let pool = Arc::new(LocalWorkerPool::start(
        WorkerPoolSettings {
            concurrency: app_config.jobs.worker_concurrency,
            shutdown_timeout: app_config.jobs.shutdown_timeout(),
        },
        store.clone(),
        reporter,
        RetryPolicy::new(&app_config.jobs),
        handlers,
    ));

    let queue: Arc<dyn JobQueue> = pool.clone();
    let services = JobServices::new(store.clone(), queue, hub.clone(), &app_config.jobs);

    if let Err(e) = services.controller.recover_interrupted().await {
        error!("Failed to recover unfinished tasks: {}", e);
    }

    let shutdown_token = CancellationToken::new();
    let sweep_handle = RetentionSweep::new(
        store,
        app_config.retention_days,
        app_config.sweep_interval_hours,
    )
    .spawn(shutdown_token.child_token());

    let server_config = server::ServerConfig {
        requests_logging_level: app_config.logging_level.clone(),
        port: app_config.port,
        metrics_port: Some(app_config.metrics_port),
    };

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        signal_token.cancel();
    });

    let result = run_server(server_config, services, shutdown_token.clone()).await;
    info!("HTTP server stopped: {:?}", result);
    shutdown_token.cancel();

    let closed = hub.shutdown();
    info!("Closed {} live connections", closed);

    pool.shutdown().await;
    if let Some(handle) = sweep_handle {
        if let Err(e) = handle.await {
            error!("Retention sweep task failed: {}", e);
        }
    }
    result
}
