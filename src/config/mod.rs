mod file_config;

pub use file_config::{FileConfig, HubConfig, JobsConfig};

use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub workers: Option<usize>,
    pub retention_days: u64,
    pub sweep_interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub retention_days: u64,
    pub sweep_interval_hours: u64,

    // Feature configs (with defaults)
    pub jobs: JobsSettings,
    pub hub: HubSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let retention_days = file.retention_days.unwrap_or(cli.retention_days);
        let sweep_interval_hours = file
            .sweep_interval_hours
            .unwrap_or(cli.sweep_interval_hours);

        // Job settings - merge file config with defaults
        let defaults = JobsSettings::default();
        let jobs_file = file.jobs.unwrap_or_default();
        let jobs = JobsSettings {
            default_max_retries: jobs_file
                .default_max_retries
                .unwrap_or(defaults.default_max_retries),
            default_retry_delay_secs: jobs_file
                .default_retry_delay_secs
                .unwrap_or(defaults.default_retry_delay_secs),
            retry_backoff_multiplier: jobs_file
                .retry_backoff_multiplier
                .unwrap_or(defaults.retry_backoff_multiplier),
            max_retry_delay_secs: jobs_file
                .max_retry_delay_secs
                .unwrap_or(defaults.max_retry_delay_secs),
            revoke_timeout_secs: jobs_file
                .revoke_timeout_secs
                .unwrap_or(defaults.revoke_timeout_secs),
            // --workers is shorthand for [jobs] worker_concurrency
            worker_concurrency: jobs_file
                .worker_concurrency
                .or(file.workers)
                .or(cli.workers)
                .unwrap_or(defaults.worker_concurrency),
            max_parameters_bytes: jobs_file
                .max_parameters_bytes
                .unwrap_or(defaults.max_parameters_bytes),
            shutdown_timeout_secs: jobs_file
                .shutdown_timeout_secs
                .unwrap_or(defaults.shutdown_timeout_secs),
        };
        if jobs.worker_concurrency == 0 {
            bail!("worker_concurrency must be at least 1");
        }
        if jobs.retry_backoff_multiplier < 1.0 {
            bail!("retry_backoff_multiplier must be >= 1.0");
        }

        let hub_file = file.hub.unwrap_or_default();
        let hub = HubSettings {
            connection_buffer: hub_file
                .connection_buffer
                .unwrap_or(HubSettings::default().connection_buffer),
        };

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            logging_level,
            retention_days,
            sweep_interval_hours,
            jobs,
            hub,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub default_max_retries: u32,
    pub default_retry_delay_secs: i64,
    pub retry_backoff_multiplier: f64,
    pub max_retry_delay_secs: u64,
    pub revoke_timeout_secs: u64,
    pub worker_concurrency: usize,
    pub max_parameters_bytes: usize,
    pub shutdown_timeout_secs: u64,
}

impl JobsSettings {
    pub fn revoke_timeout(&self) -> Duration {
        Duration::from_secs(self.revoke_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_retry_delay_secs: 60,
            retry_backoff_multiplier: 2.0,
            max_retry_delay_secs: 3600,
            revoke_timeout_secs: 5,
            worker_concurrency: 4,
            max_parameters_bytes: 1024 * 1024,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub connection_buffer: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            connection_buffer: 64,
        }
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
