use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::jobs::JobRecord;

/// Metric name prefix for all job hub metrics
const PREFIX: &str = "jobhub";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Job Metrics
    pub static ref JOBS_SUBMITTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_submitted_total"), "Jobs accepted for execution"),
        &["type"]
    ).expect("Failed to create jobs_submitted_total metric");

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Jobs reaching a completion status"),
        &["type", "status"]
    ).expect("Failed to create jobs_finished_total metric");

    pub static ref JOB_RUN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_run_duration_seconds"),
            "Time from first progress report to completion"
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        &["type"]
    ).expect("Failed to create job_run_duration_seconds metric");

    pub static ref JOB_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_retries_total"), "Job retries by origin"),
        &["source"]
    ).expect("Failed to create job_retries_total metric");

    pub static ref JOB_CANCELLATIONS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_job_cancellations_total"),
        "Jobs cancelled on request"
    ).expect("Failed to create job_cancellations_total metric");

    pub static ref JOB_REVOKE_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_job_revoke_failures_total"),
        "Terminate requests the job queue failed or timed out on"
    ).expect("Failed to create job_revoke_failures_total metric");

    pub static ref JOBS_PURGED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_purged_total"),
        "Finished job records removed by retention"
    ).expect("Failed to create jobs_purged_total metric");

    // Live Update Metrics
    pub static ref LIVE_CONNECTIONS: Gauge = Gauge::new(
        format!("{PREFIX}_live_connections"),
        "Open live-update connections"
    ).expect("Failed to create live_connections metric");

    pub static ref LIVE_SUBSCRIPTIONS: Gauge = Gauge::new(
        format!("{PREFIX}_live_subscriptions"),
        "Task subscriptions across all users"
    ).expect("Failed to create live_subscriptions metric");

    pub static ref NOTIFICATIONS_SENT_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_notifications_sent_total"), "Messages queued to connections"),
        &["type"]
    ).expect("Failed to create notifications_sent_total metric");

    pub static ref NOTIFICATION_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_notification_failures_total"), "Messages not delivered"),
        &["reason"]
    ).expect("Failed to create notification_failures_total metric");

    // Process Metrics
    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_SUBMITTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RETRIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_CANCELLATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_REVOKE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_PURGED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(LIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(LIVE_SUBSCRIPTIONS.clone()));
    let _ = REGISTRY.register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(NOTIFICATION_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_job_submitted(job_type: &str) {
    JOBS_SUBMITTED_TOTAL.with_label_values(&[job_type]).inc();
}

/// Record a job reaching SUCCESS, FAILURE or REVOKED.
pub fn record_job_finished(record: &JobRecord) {
    let job_type = record.job_type.as_str();
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_type, record.status.as_str()])
        .inc();
    if let Some(duration) = record.actual_duration() {
        JOB_RUN_DURATION_SECONDS
            .with_label_values(&[job_type])
            .observe(duration as f64);
    }
}

/// `source` is "manual" for requested retries and "handler" for automatic ones.
pub fn record_job_retry(source: &str) {
    JOB_RETRIES_TOTAL.with_label_values(&[source]).inc();
}

pub fn record_job_cancelled() {
    JOB_CANCELLATIONS_TOTAL.inc();
}

pub fn record_revoke_failure() {
    JOB_REVOKE_FAILURES_TOTAL.inc();
}

pub fn record_retention_purged(count: usize) {
    JOBS_PURGED_TOTAL.inc_by(count as f64);
}

pub fn set_live_connections(count: usize) {
    LIVE_CONNECTIONS.set(count as f64);
}

pub fn set_live_subscriptions(count: usize) {
    LIVE_SUBSCRIPTIONS.set(count as f64);
}

pub fn record_notification_sent(message_type: &str) {
    NOTIFICATIONS_SENT_TOTAL
        .with_label_values(&[message_type])
        .inc();
}

pub fn record_notification_failure(reason: &str) {
    NOTIFICATION_FAILURES_TOTAL
        .with_label_values(&[reason])
        .inc();
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    // RSS is reported in kB
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<f64>() {
                            PROCESS_MEMORY_BYTES.set(kb * 1024.0);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
