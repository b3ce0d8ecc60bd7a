// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Manager and table lifecycle state
//! - Sync (pull) throughput and cursor position
//! - Push outcomes (confirmed, conflicts, retries, failures)
//! - Subscription status and event coalescing
//! - Eviction and backup activity
//! - Circuit breaker rejections and SQLite busy retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replica_`. Counters end in `_total`,
//! gauges hold current state, histograms track durations and sizes.
//!
//! No recorder is installed by this crate; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Lifecycle
// =============================================================================

/// Gauge for manager state.
pub fn set_manager_state(state: &str) {
    let value = match state {
        "Initializing" => 0.0,
        "WaitingForSubscriptions" => 1.0,
        "Active" => 2.0,
        "ShuttingDown" => 3.0,
        "ShutDown" => 4.0,
        _ => -1.0,
    };
    gauge!("replica_manager_state").set(value);
}

/// Gauge for a table's state (1 for the current state label).
pub fn set_table_state(table: &str, state: &str) {
    gauge!("replica_table_state", "table" => table.to_string(), "state" => state.to_string())
        .set(1.0);
}

/// Count of registered tables.
pub fn set_registered_tables(count: usize) {
    gauge!("replica_registered_tables").set(count as f64);
}

/// Record how the readiness barrier settled.
pub fn record_readiness_barrier(ready: usize, degraded: usize, pending: usize, elapsed: Duration) {
    gauge!("replica_subscriptions_ready").set(ready as f64);
    gauge!("replica_subscriptions_degraded").set(degraded as f64);
    gauge!("replica_subscriptions_pending").set(pending as f64);
    histogram!("replica_readiness_wait_seconds").record(elapsed.as_secs_f64());
}

// =============================================================================
// Sync (pull)
// =============================================================================

/// Record a completed pull for one table.
pub fn record_sync(table: &str, fetched: usize, applied: usize, skipped: usize, duration: Duration) {
    let table = table.to_string();
    counter!("replica_sync_total", "table" => table.clone()).increment(1);
    counter!("replica_records_fetched_total", "table" => table.clone()).increment(fetched as u64);
    counter!("replica_records_applied_total", "table" => table.clone()).increment(applied as u64);
    if skipped > 0 {
        counter!("replica_records_skipped_total", "table" => table.clone())
            .increment(skipped as u64);
    }
    histogram!("replica_sync_duration_seconds", "table" => table).record(duration.as_secs_f64());
}

/// Record a sync trigger that was coalesced into an in-flight sync.
pub fn record_sync_coalesced(table: &str) {
    counter!("replica_sync_coalesced_total", "table" => table.to_string()).increment(1);
}

/// Gauge for a table's cursor watermark.
pub fn set_cursor(table: &str, watermark: i64) {
    gauge!("replica_cursor_watermark", "table" => table.to_string()).set(watermark as f64);
}

/// Record a per-table error by kind.
pub fn record_table_error(table: &str, kind: &str) {
    counter!(
        "replica_table_errors_total",
        "table" => table.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// Push
// =============================================================================

/// Record a push outcome (confirmed, conflict, retry, deferred, failed, superseded, lock_busy).
pub fn record_push(table: &str, outcome: &str) {
    counter!(
        "replica_push_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the backoff slept before a push retry.
pub fn record_push_backoff(table: &str, delay: Duration) {
    histogram!("replica_push_backoff_seconds", "table" => table.to_string())
        .record(delay.as_secs_f64());
}

/// Gauge for pending and failed mutation counts.
pub fn set_pending_mutations(table: &str, pending: usize, failed: usize) {
    gauge!("replica_pending_mutations", "table" => table.to_string()).set(pending as f64);
    gauge!("replica_failed_mutations", "table" => table.to_string()).set(failed as f64);
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Set subscription status gauge (0=connecting, 1=subscribed, 2=errored, 3=closed).
pub fn set_subscription_status(table: &str, status: &str) {
    let value = match status {
        "connecting" => 0.0,
        "subscribed" => 1.0,
        "errored" => 2.0,
        "closed" => 3.0,
        _ => -1.0,
    };
    gauge!("replica_subscription_status", "table" => table.to_string()).set(value);
}

/// Record a coalescer flush: events received vs. applied.
pub fn record_coalesce_flush(table: &str, received: usize, applied: usize) {
    let table = table.to_string();
    counter!("replica_events_received_total", "table" => table.clone()).increment(received as u64);
    counter!("replica_events_applied_total", "table" => table.clone()).increment(applied as u64);
    let coalesced = received.saturating_sub(applied);
    if coalesced > 0 {
        counter!("replica_events_coalesced_total", "table" => table).increment(coalesced as u64);
    }
}

// =============================================================================
// Eviction / backup
// =============================================================================

/// Record an eviction pass.
pub fn record_eviction(table: &str, ttl_evicted: usize, lru_evicted: usize) {
    let table = table.to_string();
    if ttl_evicted > 0 {
        counter!("replica_evicted_total", "table" => table.clone(), "reason" => "ttl")
            .increment(ttl_evicted as u64);
    }
    if lru_evicted > 0 {
        counter!("replica_evicted_total", "table" => table, "reason" => "lru")
            .increment(lru_evicted as u64);
    }
}

/// Record a backup snapshot write.
pub fn record_backup_write(table: &str, records: usize, duration: Duration) {
    counter!("replica_backup_writes_total", "table" => table.to_string()).increment(1);
    histogram!("replica_backup_records", "table" => table.to_string()).record(records as f64);
    histogram!("replica_backup_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Record a backup request collapsed into a later one.
pub fn record_backup_coalesced(table: &str) {
    counter!("replica_backup_coalesced_total", "table" => table.to_string()).increment(1);
}

// =============================================================================
// Circuit breaker / storage
// =============================================================================

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "replica_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

/// Record a SQLite busy retry.
pub fn record_sqlite_retry(operation: &str) {
    counter!("replica_sqlite_busy_retries_total", "operation" => operation.to_string())
        .increment(1);
}
