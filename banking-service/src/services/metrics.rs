//! Prometheus metrics for banking-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "banking_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for bank API calls by endpoint and outcome.
pub static PROVIDER_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banking_provider_requests_total",
        "Total number of bank API requests",
        &["endpoint", "status"]
    )
    .expect("Failed to register PROVIDER_REQUESTS")
});

/// Counter for sync outcomes per connection.
pub static SYNC_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banking_sync_runs_total",
        "Total number of account sync runs",
        &["outcome"]
    )
    .expect("Failed to register SYNC_RUNS")
});

/// Counter for categorization results.
pub static CATEGORIZATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banking_categorizations_total",
        "Total number of categorization decisions",
        &["outcome"]
    )
    .expect("Failed to register CATEGORIZATIONS")
});

/// Counter for rules skipped because their regex failed to compile.
pub static INVALID_RULE_PATTERNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banking_invalid_rule_patterns_total",
        "Total number of rule patterns skipped as invalid",
        &["company_id"]
    )
    .expect("Failed to register INVALID_RULE_PATTERNS")
});

/// Counter for connection state transitions.
pub static CONNECTION_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "banking_connection_transitions_total",
        "Total number of connection state transitions",
        &["from", "to"]
    )
    .expect("Failed to register CONNECTION_TRANSITIONS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PROVIDER_REQUESTS);
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&CATEGORIZATIONS);
    Lazy::force(&INVALID_RULE_PATTERNS);
    Lazy::force(&CONNECTION_TRANSITIONS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_sync_run(outcome: &str) {
    SYNC_RUNS.with_label_values(&[outcome]).inc();
}

pub fn record_categorization(outcome: &str) {
    CATEGORIZATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_connection_transition(from: &str, to: &str) {
    CONNECTION_TRANSITIONS.with_label_values(&[from, to]).inc();
}
