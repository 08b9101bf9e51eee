// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the replica router.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `replica_router_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `endpoint`: endpoint name from the topology
//! - `access`: read, write
//! - `status`: success, error, rejected, cancelled

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a primary-path operation outcome
pub fn record_operation(endpoint: &str, access: &str, status: &str) {
    counter!(
        "replica_router_operations_total",
        "endpoint" => endpoint.to_string(),
        "access" => access.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record primary-path latency, retries and re-routing included
pub fn record_latency(access: &str, duration: Duration) {
    histogram!(
        "replica_router_operation_seconds",
        "access" => access.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with component, operation and kind labels
pub fn record_error(component: &str, operation: &str, kind: &str) {
    counter!(
        "replica_router_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ROUTING HEALTH - Retries, exclusions, topology switches
// ═══════════════════════════════════════════════════════════════════════════

/// Record a retry against the same endpoint
pub fn record_retry(endpoint: &str) {
    counter!(
        "replica_router_retries_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record an endpoint being excluded after exhausting its attempts
pub fn record_exclusion(endpoint: &str) {
    counter!(
        "replica_router_exclusions_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Set the number of currently excluded endpoints and groups
pub fn set_excluded_count(count: usize) {
    gauge!("replica_router_excluded").set(count as f64);
}

/// Set endpoint availability as seen by the router
pub fn set_endpoint_available(endpoint: &str, available: bool) {
    gauge!(
        "replica_router_endpoint_available",
        "endpoint" => endpoint.to_string()
    )
    .set(if available { 1.0 } else { 0.0 });
}

/// Record a switch of the active replica group
pub fn record_active_switch(group: &str) {
    counter!(
        "replica_router_active_switches_total",
        "group" => group.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REPLICATION - Double-write pipeline
// ═══════════════════════════════════════════════════════════════════════════

/// Record a replication job outcome (applied, failed)
pub fn record_replication(target: &str, kind: &str, outcome: &str) {
    counter!(
        "replica_router_replication_jobs_total",
        "target" => target.to_string(),
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a job refused because the queue was full or closed
pub fn record_queue_rejected(target: &str) {
    counter!(
        "replica_router_replication_rejected_total",
        "target" => target.to_string()
    )
    .increment(1);
}

/// Set replication queue depth
pub fn set_queue_depth(depth: usize) {
    gauge!("replica_router_replication_queue_depth").set(depth as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// LOG SEGMENTS - Durable replication queue
// ═══════════════════════════════════════════════════════════════════════════

/// Record a job appended to a log segment
pub fn record_wal_append(backend: &str) {
    counter!(
        "replica_router_wal_appends_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record a segment being closed (rotated, idle, shutdown)
pub fn record_wal_close(backend: &str, reason: &str) {
    counter!(
        "replica_router_wal_segment_closes_total",
        "backend" => backend.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set the number of open segments
pub fn set_wal_open_segments(count: usize) {
    gauge!("replica_router_wal_open_segments").set(count as f64);
}

/// Record one replayed segment (clean, salvaged)
pub fn record_replay_segment(backend: &str, outcome: &str, applied: usize) {
    counter!(
        "replica_router_replay_segments_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    counter!(
        "replica_router_replay_jobs_total",
        "backend" => backend.to_string()
    )
    .increment(applied as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// STARTUP - Timing for cold start monitoring
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "replica_router_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set router state (for monitoring state machine transitions)
pub fn set_router_state(state: &str) {
    counter!(
        "replica_router_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    access: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(access: &'static str) -> Self {
        Self {
            access,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.access, self.start.elapsed());
    }
}
