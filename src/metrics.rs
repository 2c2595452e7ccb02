// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for index-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `index_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `mapping`: mapping file identity
//! - `strategy`: DIRECT_PATCH, MAIN_REQUERY, ...
//! - `stage`: engine, resolver, sink, etl
//! - `status`: success, error, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record change events handed to the engine
pub fn record_events(operation: &str, rows: usize) {
    counter!(
        "index_sync_event_rows_total",
        "operation" => operation.to_string()
    )
    .increment(rows as u64);
}

/// Record a strategy chosen for one row
pub fn record_strategy(mapping: &str, strategy: &str) {
    counter!(
        "index_sync_strategy_total",
        "mapping" => mapping.to_string(),
        "strategy" => strategy.to_string()
    )
    .increment(1);
}

/// Record the outcome of one row on one mapping
pub fn record_row_outcome(mapping: &str, status: &str) {
    counter!(
        "index_sync_rows_total",
        "mapping" => mapping.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record stage latency
pub fn record_latency(stage: &str, operation: &str, duration: Duration) {
    histogram!(
        "index_sync_operation_seconds",
        "stage" => stage.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// SINK COMMITS
// ═══════════════════════════════════════════════════════════════════════════

/// Record one bulk commit
pub fn record_commit(mapping: &str, success: bool, ops: usize, bytes: usize) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "index_sync_commits_total",
        "mapping" => mapping.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("index_sync_commit_ops").record(ops as f64);
    histogram!("index_sync_commit_bytes").record(bytes as f64);
}

/// Record per-operation failures reported by the sink
pub fn record_commit_failures(kind: &str, count: usize) {
    counter!(
        "index_sync_commit_failures_total",
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RESOLVER
// ═══════════════════════════════════════════════════════════════════════════

/// Record an object-field query
pub fn record_resolver_query(kind: &str, status: &str) {
    counter!(
        "index_sync_resolver_queries_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ETL
// ═══════════════════════════════════════════════════════════════════════════

/// Record rows streamed by a bulk load
pub fn record_etl_rows(mapping: &str, rows: usize) {
    counter!(
        "index_sync_etl_rows_total",
        "mapping" => mapping.to_string()
    )
    .increment(rows as u64);
}

/// Record a finished bulk load
pub fn record_etl_run(mapping: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "index_sync_etl_runs_total",
        "mapping" => mapping.to_string(),
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// MAPPINGS
// ═══════════════════════════════════════════════════════════════════════════

/// Set the number of loaded mappings
pub fn set_active_mappings(count: usize) {
    gauge!("index_sync_active_mappings").set(count as f64);
}

/// Record a mapping (re)load attempt
pub fn record_mapping_reload(outcome: &str) {
    counter!(
        "index_sync_mapping_reloads_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set batches currently being synchronized
pub fn set_inflight_batches(count: usize) {
    gauge!("index_sync_inflight_batches").set(count as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    stage: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(stage: &'static str, operation: &'static str) -> Self {
        Self {
            stage,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.stage, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the calls don't panic without a recorder installed.

    #[test]
    fn test_engine_metrics() {
        record_events("UPDATE", 3);
        record_strategy("orders.yml", "DIRECT_PATCH");
        record_row_outcome("orders.yml", "success");
        record_row_outcome("orders.yml", "error");
        set_inflight_batches(1);
    }

    #[test]
    fn test_commit_metrics() {
        record_commit("orders.yml", true, 10, 2048);
        record_commit("orders.yml", false, 1, 64);
        record_commit_failures("not_found", 2);
    }

    #[test]
    fn test_resolver_and_etl_metrics() {
        record_resolver_query("array", "success");
        record_etl_rows("orders.yml", 500);
        record_etl_run("orders.yml", true);
    }

    #[test]
    fn test_mapping_gauges() {
        set_active_mappings(4);
        record_mapping_reload("applied");
        record_mapping_reload("rejected");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("resolver", "query");
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}
