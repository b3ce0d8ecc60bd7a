// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records, table registrations and the field-level rebase.
//!
//! # Rebase
//!
//! When a local optimistic write meets a newer server row (a push conflict,
//! or a remote delta for a dirty row), the local intent is re-applied on top
//! of the server row:
//!
//! ```text
//! base    = server row the local write started from
//! desired = local write
//! server  = latest server row
//!
//! result  = server
//!         + every field where desired != base   (local intent wins)
//!         - every field local removed from base
//! ```
//!
//! Fields the client never touched always take the server value. A local
//! delete stays a delete.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Schema-less record payload.
pub type Payload = serde_json::Map<String, Value>;

/// Monotonic change marker assigned by the remote store.
pub type Watermark = i64;

/// One row of a table's local replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// Primary key (stringified).
    pub key: String,
    /// Row contents.
    pub payload: Payload,
    /// Watermark of the last server state this row reflects.
    pub watermark: Watermark,
    /// Locally mutated, not yet confirmed by the remote.
    pub dirty: bool,
    /// Millis since epoch of the last time the server state was applied.
    #[serde(default)]
    pub synced_at: Option<i64>,
}

impl ReplicaRecord {
    /// A clean row straight from the server.
    pub fn from_server(key: impl Into<String>, payload: Payload, watermark: Watermark, now_ms: i64) -> Self {
        Self {
            key: key.into(),
            payload,
            watermark,
            dirty: false,
            synced_at: Some(now_ms),
        }
    }

    /// Field accessor.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}

/// How a table sheds rows it no longer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep everything.
    #[default]
    None,
    /// Drop clean rows not refreshed within the TTL.
    Ttl,
    /// Keep at most `max_records`, dropping least recently read first.
    Lru { max_records: usize },
    /// TTL first, then LRU.
    TtlLru { max_records: usize },
}

impl EvictionPolicy {
    pub fn uses_ttl(&self) -> bool {
        matches!(self, Self::Ttl | Self::TtlLru { .. })
    }

    pub fn max_records(&self) -> Option<usize> {
        match self {
            Self::Lru { max_records } | Self::TtlLru { max_records } => Some(*max_records),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ttl => "ttl",
            Self::Lru { .. } => "lru",
            Self::TtlLru { .. } => "ttl_lru",
        }
    }
}

/// Registration of one replicated table. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRegistration {
    /// Table name, identical locally and remotely.
    pub name: String,

    /// Payload field holding the primary key.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Staleness bound as a duration string (e.g., "10m"). `None` = never stale.
    #[serde(default)]
    pub ttl: Option<String>,

    #[serde(default)]
    pub eviction: EvictionPolicy,

    /// Open a realtime channel for this table.
    #[serde(default = "default_true")]
    pub realtime: bool,

    /// Keep a debounced backup snapshot for cold-start recovery.
    #[serde(default)]
    pub backup: bool,

    /// Extra server-side filter, ANDed with the tenant predicate.
    #[serde(default)]
    pub filter: Option<String>,

    /// Tenant the caller believes this table belongs to. Checked at registration.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

impl TableRegistration {
    /// Realtime table keyed by `id`, no TTL, no eviction, no backup.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: default_primary_key(),
            ttl: None,
            eviction: EvictionPolicy::None,
            realtime: true,
            backup: false,
            filter: None,
            tenant_id: None,
        }
    }

    pub fn with_primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(humantime::format_duration(ttl).to_string());
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Parse the TTL string. Unparseable values are treated as "no TTL".
    pub fn ttl_duration(&self) -> Option<Duration> {
        self.ttl
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }

    /// Extract this table's primary key from a payload.
    pub fn key_of(&self, payload: &Payload) -> Option<String> {
        key_of(payload, &self.primary_key)
    }
}

/// Stringify a primary-key field. Only strings and numbers are keys.
pub fn key_of(payload: &Payload, primary_key: &str) -> Option<String> {
    match payload.get(primary_key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Re-apply a local intent on top of the latest server row.
///
/// Returns `None` when the local intent is a delete.
pub fn rebase(base: Option<&Payload>, desired: Option<&Payload>, server: Option<&Payload>) -> Option<Payload> {
    let desired = desired?;
    let mut merged = server.cloned().unwrap_or_default();

    match base {
        Some(base) => {
            for (field, value) in desired {
                if base.get(field) != Some(value) {
                    merged.insert(field.clone(), value.clone());
                }
            }
            for field in base.keys() {
                if !desired.contains_key(field) {
                    merged.remove(field);
                }
            }
        }
        // Local insert: every field is intent.
        None => {
            for (field, value) in desired {
                merged.insert(field.clone(), value.clone());
            }
        }
    }

    Some(merged)
}
