//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Packet routing and protocol violations
//! - Retry channel sends, retries and drops
//! - Backup applies and forced unlocks
//! - Wait/notify parking outcomes
//! - Invocation outcomes and latency
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `node_engine_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use node_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_packet_routed("operation");
//! metrics::record_invocation("ok", Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Dispatch Metrics
// =============================================================================

/// Record an inbound packet routed to a subsystem.
pub fn record_packet_routed(route: &str) {
    counter!("node_engine_packets_routed_total", "route" => route.to_string()).increment(1);
}

/// Record a packet discarded because its header or framing was malformed.
pub fn record_protocol_violation(reason: &str) {
    counter!("node_engine_protocol_violations_total", "reason" => reason.to_string()).increment(1);
}

/// Record an operation executed on this member.
pub fn record_operation_executed(service: &str, outcome: &str) {
    counter!(
        "node_engine_operations_executed_total",
        "service" => service.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an operation addressed to an unregistered service.
pub fn record_unknown_service(service: &str) {
    counter!("node_engine_unknown_service_total", "service" => service.to_string()).increment(1);
}

// =============================================================================
// Retry Channel Metrics
// =============================================================================

/// Record the outcome of a send (written, queued, rejected).
pub fn record_send(status: &str) {
    counter!("node_engine_sends_total", "status" => status.to_string()).increment(1);
}

/// Record a pending-send retry attempt.
pub fn record_send_retry(attempt: u32) {
    counter!("node_engine_send_retries_total").increment(1);
    histogram!("node_engine_send_retry_attempt").record(attempt as f64);
}

/// Record a packet dropped after the retry budget ran out.
pub fn record_send_dropped(target: &str) {
    counter!("node_engine_sends_dropped_total", "target" => target.to_string()).increment(1);
}

/// Gauge for pending sends waiting for a connection.
pub fn set_pending_sends(count: usize) {
    gauge!("node_engine_pending_sends").set(count as f64);
}

// =============================================================================
// Backup Metrics
// =============================================================================

/// Record a backup write applied to a record store.
pub fn record_backup_applied(store: &str, created: bool) {
    let kind = if created { "create" } else { "update" };
    counter!(
        "node_engine_backups_applied_total",
        "store" => store.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a lock released by the backup path without an owner check.
pub fn record_forced_unlock(store: &str) {
    counter!("node_engine_forced_unlocks_total", "store" => store.to_string()).increment(1);
}

/// Gauge for a record store's estimated size in bytes.
pub fn set_record_store_size(store: &str, bytes: i64) {
    gauge!("node_engine_record_store_bytes", "store" => store.to_string()).set(bytes as f64);
}

/// Record a sync backup acknowledgement that did not arrive in time.
pub fn record_backup_ack_timeout() {
    counter!("node_engine_backup_ack_timeouts_total").increment(1);
}

// =============================================================================
// Wait/Notify Metrics
// =============================================================================

/// Record a waiting operation outcome (parked, resumed, expired, invalidated, aborted).
pub fn record_waiting_op(outcome: &str) {
    counter!("node_engine_waiting_ops_total", "outcome" => outcome.to_string()).increment(1);
}

/// Gauge for operations currently parked.
pub fn set_waiting_ops(count: usize) {
    gauge!("node_engine_waiting_ops").set(count as f64);
}

// =============================================================================
// Invocation Metrics
// =============================================================================

/// Record a completed invocation with its outcome and latency.
pub fn record_invocation(outcome: &str, duration: Duration) {
    counter!("node_engine_invocations_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("node_engine_invocation_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record a partition invocation retry after a retryable failure.
pub fn record_invocation_retry(reason: &str) {
    counter!("node_engine_invocation_retries_total", "reason" => reason.to_string()).increment(1);
}

/// Gauge for invocations awaiting a response.
pub fn set_inflight_invocations(count: usize) {
    gauge!("node_engine_inflight_invocations").set(count as f64);
}

// =============================================================================
// Cluster Metrics
// =============================================================================

/// Record a membership or migration notification.
pub fn record_topology_event(kind: &str) {
    counter!("node_engine_topology_events_total", "kind" => kind.to_string()).increment(1);
}

/// Record a post-join candidate rejected for declaring partition affinity.
pub fn record_post_join_rejected(service: &str) {
    counter!("node_engine_post_join_rejected_total", "service" => service.to_string()).increment(1);
}

/// Record an event published to listeners.
pub fn record_event_published(service: &str, local: bool) {
    let delivery = if local { "local" } else { "remote" };
    counter!(
        "node_engine_events_published_total",
        "service" => service.to_string(),
        "delivery" => delivery
    )
    .increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("node_engine_state").set(value);
}
