// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Manager and table state types.
//!
//! # Manager state
//!
//! ```text
//!                 open()
//! Initializing ──────────── register_table() × N (each opens its channel)
//!      │
//!      │ wait_for_subscriptions_ready()
//!      ↓
//! WaitingForSubscriptions ── all settled, or timeout (logs pending tables)
//!      │
//!      ↓
//!   Active ──── start_auto_sync() / sync_all() / sync_table() allowed
//!      │
//!      │ shutdown()
//!      ↓
//! ShuttingDown ── drain tasks → close tables (bounded) → close channels → flush backups
//!      │
//!      ↓
//!   ShutDown
//! ```
//!
//! # Table state
//!
//! ```text
//! Unregistered → Registering → Subscribing → Ready → Syncing ⇄ Idle → Closing → Closed
//! ```
//!
//! `Ready` means the table's readiness handle settled (subscribed or degraded)
//! or the barrier gave up waiting for it. A table is never synced before then.

use crate::circuit_breaker::CircuitMetrics;
use crate::remote::ChannelStatus;
use crate::sync_engine::TableSyncReport;
use crate::table::TableHealth;
use std::time::Duration;

/// Lifecycle of the manager.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Opened; tables may be registered.
    Initializing,

    /// Joining the tables' readiness handles.
    WaitingForSubscriptions,

    /// Barrier passed. Syncs may run.
    Active,

    /// `shutdown()` in progress. New registrations and syncs are refused.
    ShuttingDown,

    /// Stores closed. Safe to drop.
    ShutDown,
}

impl ManagerState {
    /// Whether new work (registrations, syncs, writes) is still accepted.
    pub fn accepts_work(&self) -> bool {
        !matches!(self, Self::ShuttingDown | Self::ShutDown)
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Initializing => write!(f, "Initializing"),
            ManagerState::WaitingForSubscriptions => write!(f, "WaitingForSubscriptions"),
            ManagerState::Active => write!(f, "Active"),
            ManagerState::ShuttingDown => write!(f, "ShuttingDown"),
            ManagerState::ShutDown => write!(f, "ShutDown"),
        }
    }
}

/// Lifecycle of one registered table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Unregistered,
    Registering,
    Subscribing,
    Ready,
    Syncing,
    Idle,
    Closing,
    Closed,
}

impl TableState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Unregistered => "unregistered",
            TableState::Registering => "registering",
            TableState::Subscribing => "subscribing",
            TableState::Ready => "ready",
            TableState::Syncing => "syncing",
            TableState::Idle => "idle",
            TableState::Closing => "closing",
            TableState::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TableState::Closing | TableState::Closed)
    }
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the readiness barrier settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadinessReport {
    /// Tables whose channel reached "subscribed" (or that don't use realtime).
    pub ready: Vec<String>,
    /// Tables running polling-only, with the reason.
    pub degraded: Vec<(String, String)>,
    /// Tables still connecting when the barrier timed out.
    pub pending: Vec<String>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ReadinessReport {
    /// Every table settled one way or the other.
    pub fn all_settled(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outcome of one table's sync trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSyncStatus {
    Synced(TableSyncReport),
    /// The table was already syncing; this trigger became a no-op.
    Coalesced,
    /// The sync failed; the error went to diagnostics. Sibling tables are
    /// unaffected and the next trigger retries.
    Failed {
        kind: &'static str,
        message: String,
        retryable: bool,
    },
}

impl TableSyncStatus {
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-table part of [`HealthCheck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHealthReport {
    pub state: TableState,
    pub health: TableHealth,
    /// `None` for tables without a realtime channel.
    pub subscription: Option<ChannelStatus>,
    /// Running polling-only because the channel never subscribed or errored.
    pub degraded: bool,
}

/// Health snapshot for monitoring endpoints.
///
/// Built from cached state only; no network or storage I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: ManagerState,
    /// Barrier passed and not shutting down.
    pub ready: bool,
    /// Ready, no degraded tables and no failed mutations.
    pub healthy: bool,
    pub tables: Vec<TableHealthReport>,
    pub degraded_tables: usize,
    pub failed_mutations: usize,
    pub circuit: CircuitMetrics,
}
