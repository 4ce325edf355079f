//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Registry polling and dispatch
//! - Scan throughput
//! - Tail flush behavior (batch size, bulk mode, latency)
//! - Recoverable reconnects and worker failures
//! - Control store contention
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `index_replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use index_replicator::metrics;
//! use std::time::Duration;
//!
//! // In the scan worker after a page is written
//! metrics::record_scan_page("node-1", 1000, Duration::from_millis(120));
//!
//! // In the tail worker after a flush
//! metrics::record_tail_flush("node-1", 42, true, Duration::from_millis(15));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one registry poll cycle.
pub fn record_registry_poll(nodes: usize, duration: Duration) {
    counter!("index_replicator_registry_polls_total").increment(1);
    gauge!("index_replicator_registry_nodes").set(nodes as f64);
    histogram!("index_replicator_registry_poll_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed registry poll.
pub fn record_registry_poll_failure() {
    counter!("index_replicator_registry_poll_failures_total").increment(1);
}

/// Record a worker dispatch.
pub fn record_node_dispatched(phase: &str) {
    counter!("index_replicator_nodes_dispatched_total", "phase" => phase.to_string()).increment(1);
}

/// Gauge for live-map size per phase.
pub fn set_live_nodes(phase: &str, count: usize) {
    gauge!("index_replicator_live_nodes", "phase" => phase.to_string()).set(count as f64);
}

/// Record a scan page written to the sink.
pub fn record_scan_page(node_id: &str, docs: usize, duration: Duration) {
    let node = node_id.to_string();
    counter!("index_replicator_scan_documents_total", "node_id" => node.clone())
        .increment(docs as u64);
    histogram!("index_replicator_scan_page_duration_seconds", "node_id" => node)
        .record(duration.as_secs_f64());
}

/// Record a change-feed entry skipped before staging.
pub fn record_tail_skipped(node_id: &str, reason: &str) {
    counter!(
        "index_replicator_tail_skipped_total",
        "node_id" => node_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a tail flush with batch stats.
pub fn record_tail_flush(node_id: &str, operations: usize, bulk_mode: bool, duration: Duration) {
    let node = node_id.to_string();
    let mode = if bulk_mode { "bulk" } else { "single" };

    counter!("index_replicator_tail_operations_total", "node_id" => node.clone())
        .increment(operations as u64);
    counter!("index_replicator_tail_flushes_total", "node_id" => node.clone(), "mode" => mode)
        .increment(1);
    histogram!("index_replicator_bulk_flush_duration_seconds", "node_id" => node.clone())
        .record(duration.as_secs_f64());
    histogram!("index_replicator_batch_size", "node_id" => node).record(operations as f64);
}

/// Gauge for the tail worker's batching mode (1 = accumulating).
pub fn set_bulk_mode(node_id: &str, bulk_mode: bool) {
    gauge!("index_replicator_tail_bulk_mode", "node_id" => node_id.to_string())
        .set(if bulk_mode { 1.0 } else { 0.0 });
}

/// Record a recoverable change-feed error followed by a reconnect.
pub fn record_reconnect(node_id: &str) {
    counter!("index_replicator_reconnects_total", "node_id" => node_id.to_string()).increment(1);
}

/// Record a worker parked in an exception status.
pub fn record_worker_failure(node_id: &str, phase: &str, error_type: &str) {
    counter!(
        "index_replicator_worker_failures_total",
        "node_id" => node_id.to_string(),
        "phase" => phase.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a worker exit on a stop request.
pub fn record_worker_stopped(node_id: &str, phase: &str) {
    counter!(
        "index_replicator_worker_stops_total",
        "node_id" => node_id.to_string(),
        "phase" => phase.to_string()
    )
    .increment(1);
}

/// Record control store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn control_store_retries_total(operation: &str) {
    counter!("index_replicator_control_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("index_replicator_engine_state").set(value);
}
