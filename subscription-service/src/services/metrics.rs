//! Metrics module for subscription-service.
//! Provides Prometheus metrics for lifecycle transitions, quota metering and batch jobs.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Lifecycle operations by outcome
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Entitlement consumption attempts by outcome
pub static ENTITLEMENT_USAGE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Background job runs by status
pub static JOB_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Rows changed by background jobs
pub static JOB_ROWS_UPDATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_operations_total",
                "Total subscription lifecycle operations by type and outcome"
            ),
            &["operation", "outcome"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    ENTITLEMENT_USAGE_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_entitlement_usage_total",
                "Entitlement consumption attempts by category and outcome"
            ),
            &["category_id", "outcome"]
        )
        .expect("Failed to register ENTITLEMENT_USAGE_TOTAL")
    });

    JOB_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_job_runs_total", "Background job runs by status"),
            &["job", "status"]
        )
        .expect("Failed to register JOB_RUNS_TOTAL")
    });

    JOB_ROWS_UPDATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_job_rows_updated_total",
                "Rows changed by background jobs"
            ),
            &["job"]
        )
        .expect("Failed to register JOB_ROWS_UPDATED_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_errors_total", "Total errors by kind for alerting"),
            &["kind", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a lifecycle operation.
pub fn record_subscription_operation(operation: &str, outcome: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Record an entitlement consumption attempt.
pub fn record_entitlement_usage(category_id: i32, outcome: &str) {
    if let Some(counter) = ENTITLEMENT_USAGE_TOTAL.get() {
        counter
            .with_label_values(&[category_id.to_string().as_str(), outcome])
            .inc();
    }
}

/// Record a background job run and the rows it changed.
pub fn record_job_run(job: &str, status: &str, rows_updated: u64) {
    if let Some(counter) = JOB_RUNS_TOTAL.get() {
        counter.with_label_values(&[job, status]).inc();
    }
    if let Some(counter) = JOB_ROWS_UPDATED_TOTAL.get() {
        counter.with_label_values(&[job]).inc_by(rows_updated);
    }
}

/// Record an error for alerting.
pub fn record_error(kind: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[kind, operation]).inc();
    }
}
