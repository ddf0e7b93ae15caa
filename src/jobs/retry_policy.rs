//! Backoff for resubmitted jobs.
//!
//! Each record carries its own base `retry_delay`; the policy grows it
//! exponentially with the retry count and caps it.

use std::time::Duration;

use crate::config::JobsSettings;

use super::models::JobRecord;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Upper bound for any single countdown, in seconds.
    pub max_delay_secs: u64,
}

impl RetryPolicy {
    pub fn new(config: &JobsSettings) -> Self {
        Self {
            backoff_multiplier: config.retry_backoff_multiplier,
            max_delay_secs: config.max_retry_delay_secs,
        }
    }

    /// Delay in seconds before attempt number `retry_count` (1-based).
    ///
    /// `base_delay * multiplier^(retry_count - 1)`, capped at `max_delay_secs`.
    pub fn backoff_secs(&self, base_delay_secs: i64, retry_count: u32) -> u64 {
        if base_delay_secs <= 0 {
            return 0;
        }
        let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = base_delay_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_delay_secs as f64) as u64
    }

    /// Countdown for resubmitting `record`, whose `retry_count` was already
    /// incremented for the upcoming attempt.
    pub fn countdown_for(&self, record: &JobRecord) -> Option<Duration> {
        match self.backoff_secs(record.retry_delay, record.retry_count) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&JobsSettings::default())
    }
}
