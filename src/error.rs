// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replica engine.
//!
//! Errors are grouped by where they originate (remote store, local SQLite,
//! subscription channel, lifecycle) and carry the table they belong to when
//! that is known, so the manager can report them per table.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `TransientNetwork` | Yes | Fetch/push failed on connectivity, or circuit open |
//! | `Conflict` | Yes | Row changed remotely since the base watermark (rebase and retry) |
//! | `Timeout` | Yes | Operation exceeded its bound; transaction aborted, guard released |
//! | `LockBusy` | Yes | Another push for the same row is in flight |
//! | `RemoteRejected` | No | Remote refused the request outright |
//! | `Storage` | No | Local SQLite failure (fatal for this table's operation only) |
//! | `Subscription` | No | Channel never reached "subscribed"; table polls instead |
//! | `MutationFailed` | No | Mutation rejected by the remote or out of conflict budget |
//! | `TableNotRegistered` | No | Unknown table name |
//! | `TenantMismatch` | No | Registration scoped to another tenant |
//! | `BackupCorrupt` | No | Backup checksum did not verify |
//! | `Serialization` | No | Payload could not be encoded/decoded |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Manager state machine violation |
//! | `Shutdown` | No | Manager is shutting down |
//! | `Internal` | No | Unexpected internal error |

use std::time::Duration;
use thiserror::Error;

/// Result type alias for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Errors that can occur while replicating tables.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// Fetch or push failed because the remote was unreachable.
    ///
    /// Retried with bounded backoff, never fatal.
    #[error("Transient network error ({table}): {message}")]
    TransientNetwork { table: String, message: String },

    /// The remote rejected a push because the row moved on since the
    /// client's base watermark.
    #[error("Conflict on {table}/{key}: {message}")]
    Conflict {
        table: String,
        key: String,
        message: String,
    },

    /// The remote refused a request (bad payload, permission, schema).
    #[error("Remote rejected request ({table}): {message}")]
    RemoteRejected { table: String, message: String },

    /// Local SQLite error.
    ///
    /// Fatal for the current operation of one table; siblings are unaffected.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Subscription channel could not reach "subscribed".
    #[error("Subscription error ({table}): {message}")]
    Subscription { table: String, message: String },

    /// Operation exceeded its time bound.
    #[error("Timed out after {}: {operation}", humantime::format_duration(*.limit))]
    Timeout { operation: String, limit: Duration },

    /// Another push for this row currently holds the row lock.
    #[error("Row lock busy: {table}/{key}")]
    LockBusy { table: String, key: String },

    /// A mutation was surfaced as failed (never silently dropped).
    #[error("Mutation failed on {table}/{key}: {reason}")]
    MutationFailed {
        table: String,
        key: String,
        reason: String,
    },

    /// No table registered under this name.
    #[error("Table not registered: {0}")]
    TableNotRegistered(String),

    /// Registration names a tenant other than the manager's.
    #[error("Tenant mismatch: expected {expected}, got {actual}")]
    TenantMismatch { expected: String, actual: String },

    /// Backup snapshot failed checksum verification.
    #[error("Backup snapshot for {table} is corrupt")]
    BackupCorrupt { table: String },

    /// Payload (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manager or table state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicaError {
    /// Build a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit,
        }
    }

    /// Build an invalid-state error from anything displayable.
    pub fn invalid_state(expected: impl std::fmt::Display, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } => true,
            Self::Conflict { .. } => true, // rebase then retry
            Self::Timeout { .. } => true,
            Self::LockBusy { .. } => true,
            Self::RemoteRejected { .. } => false,
            Self::Storage(_) => false, // local DB issues need attention
            Self::Subscription { .. } => false,
            Self::MutationFailed { .. } => false,
            Self::TableNotRegistered(_) => false,
            Self::TenantMismatch { .. } => false,
            Self::BackupCorrupt { .. } => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// The table this error belongs to, if it carries one.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::TransientNetwork { table, .. }
            | Self::Conflict { table, .. }
            | Self::RemoteRejected { table, .. }
            | Self::Subscription { table, .. }
            | Self::LockBusy { table, .. }
            | Self::MutationFailed { table, .. }
            | Self::BackupCorrupt { table } => Some(table),
            Self::TableNotRegistered(table) => Some(table),
            _ => None,
        }
    }

    /// Short machine-friendly kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork { .. } => "transient_network",
            Self::Conflict { .. } => "conflict",
            Self::RemoteRejected { .. } => "remote_rejected",
            Self::Storage(_) => "storage",
            Self::Subscription { .. } => "subscription",
            Self::Timeout { .. } => "timeout",
            Self::LockBusy { .. } => "lock_busy",
            Self::MutationFailed { .. } => "mutation_failed",
            Self::TableNotRegistered(_) => "table_not_registered",
            Self::TenantMismatch { .. } => "tenant_mismatch",
            Self::BackupCorrupt { .. } => "backup_corrupt",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
