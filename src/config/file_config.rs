use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,
    pub workers: Option<usize>,
    pub retention_days: Option<u64>,
    pub sweep_interval_hours: Option<u64>,

    // Feature configs
    pub jobs: Option<JobsConfig>,
    pub hub: Option<HubConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub default_max_retries: Option<u32>,
    pub default_retry_delay_secs: Option<i64>,
    pub retry_backoff_multiplier: Option<f64>,
    pub max_retry_delay_secs: Option<u64>,
    pub revoke_timeout_secs: Option<u64>,
    pub worker_concurrency: Option<usize>,
    pub max_parameters_bytes: Option<usize>,
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HubConfig {
    /// Outgoing messages buffered per live connection.
    pub connection_buffer: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
