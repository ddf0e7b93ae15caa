//! Periodic deletion of old terminal records.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::JobResult;
use super::store::JobStore;
use crate::server::metrics;

pub struct RetentionSweep {
    store: Arc<dyn JobStore>,
    retention_days: u64,
    interval: Duration,
}

impl RetentionSweep {
    pub fn new(store: Arc<dyn JobStore>, retention_days: u64, interval_hours: u64) -> Self {
        Self {
            store,
            retention_days,
            interval: Duration::from_secs(interval_hours.max(1) * 60 * 60),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.retention_days > 0
    }

    /// Delete terminal records completed more than `retention_days` before `now`.
    pub fn sweep_once(&self, now: i64) -> JobResult<usize> {
        let cutoff = now - (self.retention_days as i64 * 24 * 60 * 60);
        let purged = self.store.purge_terminal_before(cutoff)?;
        metrics::record_retention_purged(purged);
        Ok(purged)
    }

    /// Run the sweep every interval until `shutdown` fires. Returns `None`
    /// when retention is disabled.
    pub fn spawn(self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            info!("Task retention sweep disabled");
            return None;
        }
        info!(
            "Task retention enabled: keeping {} days, sweeping every {:?}",
            self.retention_days, self.interval
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.sweep_once(chrono::Utc::now().timestamp()) {
                    Ok(0) => debug!("Retention sweep found nothing to purge"),
                    Ok(count) => info!("Purged {} finished tasks", count),
                    Err(e) => error!("Failed to purge finished tasks: {}", e),
                }
            }
            debug!("Retention sweep stopped");
        }))
    }
}
