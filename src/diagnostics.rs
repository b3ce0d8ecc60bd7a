// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Injected collaborators: diagnostics sink and TTL policy.
//!
//! The engine never reaches for process-global reporting utilities. The host
//! passes a [`Collaborators`] bundle to the manager; every table and the sync
//! engine report through it. Logging itself goes through `tracing`, whose
//! subscriber the host installs.

use crate::record::TableRegistration;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Something the host application may want to surface or record.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// A per-table operation failed. Sibling tables are unaffected.
    TableError {
        table: String,
        operation: &'static str,
        kind: &'static str,
        message: String,
        retryable: bool,
    },
    /// A table's realtime channel never reached "subscribed"; it polls instead.
    SubscriptionDegraded { table: String, reason: String },
    /// A mutation was surfaced as failed and needs user attention.
    MutationFailed {
        table: String,
        key: String,
        reason: String,
    },
    /// The readiness barrier timed out with these tables still connecting.
    ReadinessTimedOut { pending: Vec<String> },
    /// A table was restored from its backup snapshot on cold start.
    BackupRestored { table: String, records: usize },
}

impl DiagnosticEvent {
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::TableError { table, .. }
            | Self::SubscriptionDegraded { table, .. }
            | Self::MutationFailed { table, .. }
            | Self::BackupRestored { table, .. } => Some(table),
            Self::ReadinessTimedOut { .. } => None,
        }
    }
}

/// Receives diagnostics. Must not block.
pub trait DiagnosticsSink: Send + Sync + 'static {
    fn report(&self, event: DiagnosticEvent);
}

/// Default sink: structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        match event {
            DiagnosticEvent::TableError {
                table,
                operation,
                kind,
                message,
                retryable,
            } => warn!(table = %table, operation, kind, retryable, error = %message, "Table operation failed"),
            DiagnosticEvent::SubscriptionDegraded { table, reason } => {
                warn!(table = %table, reason = %reason, "Subscription degraded to polling")
            }
            DiagnosticEvent::MutationFailed { table, key, reason } => {
                warn!(table = %table, key = %key, reason = %reason, "Mutation failed")
            }
            DiagnosticEvent::ReadinessTimedOut { pending } => {
                warn!(pending = ?pending, "Readiness barrier timed out")
            }
            DiagnosticEvent::BackupRestored { table, records } => {
                info!(table = %table, records, "Restored table from backup")
            }
        }
    }
}

/// Decides each table's TTL for eviction.
pub trait TtlPolicyProvider: Send + Sync + 'static {
    fn ttl_for(&self, registration: &TableRegistration) -> Option<Duration>;
}

/// Default policy: whatever the registration says.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistrationTtl;

impl TtlPolicyProvider for RegistrationTtl {
    fn ttl_for(&self, registration: &TableRegistration) -> Option<Duration> {
        registration.ttl_duration()
    }
}

/// Everything injected into the manager at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    pub ttl_policy: Arc<dyn TtlPolicyProvider>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            diagnostics: Arc::new(TracingDiagnostics),
            ttl_policy: Arc::new(RegistrationTtl),
        }
    }
}

impl Collaborators {
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn with_ttl_policy(mut self, policy: Arc<dyn TtlPolicyProvider>) -> Self {
        self.ttl_policy = policy;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
