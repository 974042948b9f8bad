//! Metrics for the dispatch engine
//!
//! Prometheus-compatible counters and gauges for:
//! - Destinations handed to workers and batches issued
//! - Submission outcomes (accepted, retried, dropped)
//! - Session lifecycle (binds, bind failures, reconnects)

use metrics::{counter, gauge};

/// Record a destination posted to a worker
pub fn record_destination_dispatched() {
    counter!("bulk_destinations_dispatched_total").increment(1);
}

/// Record a batch fully posted
pub fn record_batch_issued(size: usize) {
    counter!("bulk_batches_issued_total").increment(1);
    gauge!("bulk_last_batch_size").set(size as f64);
}

/// Record the outcome of one submit_sm (`accepted`, `retried`, `dropped`)
pub fn record_submission(endpoint: &str, outcome: &str) {
    counter!(
        "bulk_submissions_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a successful bind
pub fn record_session_bound(endpoint: &str) {
    counter!(
        "bulk_session_binds_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a failed connect or bind
pub fn record_bind_failure(endpoint: &str) {
    counter!(
        "bulk_bind_failures_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a bound session lost
pub fn record_session_lost(endpoint: &str) {
    counter!(
        "bulk_session_reconnects_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Update ready workers gauge
pub fn set_ready_workers(count: usize) {
    gauge!("bulk_ready_workers").set(count as f64);
}

/// Record how a run ended (`completed`, `stopped`, `failed`)
pub fn record_run_finished(outcome: &str) {
    counter!(
        "bulk_runs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
