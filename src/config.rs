// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replica engine.
//!
//! Passed to [`ReplicationManager::open()`](crate::ReplicationManager::open).
//! Can be built programmatically or deserialized from YAML/JSON by the host.
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── tenant_id: String              # Every table and remote call is scoped to this
//! ├── settings: ReplicationSettings
//! │   ├── sync: SyncConfig           # Pull cadence, fetch timeout, readiness wait
//! │   ├── subscription: SubscriptionConfig  # Handshake, coalescing, rate limit
//! │   ├── push: PushConfig           # Bounded backoff, conflict budget, circuit
//! │   ├── eviction: EvictionConfig
//! │   ├── backup: BackupConfig       # Fallback store for cold-start recovery
//! │   └── shutdown: ShutdownConfig
//! ├── tables: Vec<TableRegistration> # Registered at init
//! └── store: StoreConfig             # Local SQLite
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! tenant_id: "club-1042"
//!
//! settings:
//!   sync:
//!     auto_sync_interval: "30s"
//!     ready_timeout: "5s"
//!   push:
//!     max_attempts: 5
//!     base_delay: "100ms"
//!     max_delay: "10s"
//!
//! tables:
//!   - name: entries
//!     ttl: "12h"
//!     backup: true
//!   - name: classes
//!     eviction: { kind: lru, max_records: 500 }
//!
//! store:
//!   sqlite_path: "/var/lib/app/replica.db"
//! ```

use crate::record::TableRegistration;
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationManager::open()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Tenant (license) every table and remote call is scoped to.
    pub tenant_id: String,

    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Tables registered by `init()`.
    #[serde(default)]
    pub tables: Vec<TableRegistration>,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            tenant_id: "local-dev".to_string(),
            settings: ReplicationSettings::default(),
            tables: Vec::new(),
            store: StoreConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Short timings, files under `dir`.
    pub fn for_testing(tenant_id: &str, dir: &Path) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            settings: ReplicationSettings::for_testing(dir),
            tables: Vec::new(),
            store: StoreConfig::for_testing(dir),
        }
    }

    pub fn with_table(mut self, registration: TableRegistration) -> Self {
        self.tables.push(registration);
        self
    }
}

/// Tunables grouped by concern.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub eviction: EvictionConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl ReplicationSettings {
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            sync: SyncConfig {
                auto_sync_interval: "100ms".into(),
                fetch_timeout: "1s".into(),
                ready_timeout: "200ms".into(),
                reconnect_sync: true,
            },
            subscription: SubscriptionConfig {
                handshake_timeout: "1s".into(),
                coalesce_window: "20ms".into(),
                ..Default::default()
            },
            push: PushConfig::for_testing(),
            eviction: EvictionConfig {
                enabled: true,
                interval: "100ms".into(),
            },
            backup: BackupConfig {
                enabled: true,
                sqlite_path: dir.join("backup.db").to_string_lossy().to_string(),
                debounce: "30ms".into(),
                interval: "200ms".into(),
            },
            shutdown: ShutdownConfig {
                drain_timeout: "500ms".into(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfig: pull cadence
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Periodic sync interval once auto-sync starts.
    #[serde(default = "default_auto_sync_interval")]
    pub auto_sync_interval: String,

    /// Bound on a single `fetch_since` call.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: String,

    /// Default wait for the subscription readiness barrier.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: String,

    /// Run `sync_all` when the host reports a reconnect.
    #[serde(default = "default_true")]
    pub reconnect_sync: bool,
}

fn default_auto_sync_interval() -> String {
    "30s".to_string()
}

fn default_fetch_timeout() -> String {
    "10s".to_string()
}

fn default_ready_timeout() -> String {
    "5s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_interval: default_auto_sync_interval(),
            fetch_timeout: default_fetch_timeout(),
            ready_timeout: default_ready_timeout(),
            reconnect_sync: true,
        }
    }
}

impl SyncConfig {
    pub fn auto_sync_interval(&self) -> Duration {
        parse_or(&self.auto_sync_interval, Duration::from_secs(30))
    }

    pub fn fetch_timeout(&self) -> Duration {
        parse_or(&self.fetch_timeout, Duration::from_secs(10))
    }

    pub fn ready_timeout(&self) -> Duration {
        parse_or(&self.ready_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SubscriptionConfig: realtime channels
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Bound on opening a channel and reaching "subscribed".
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: String,

    /// Events for the same row within this window collapse into one.
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window: String,

    /// Flush early once this many distinct rows are buffered.
    #[serde(default = "default_coalesce_max_batch")]
    pub coalesce_max_batch: usize,

    /// Sustained rate of applied events per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst allowance above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_handshake_timeout() -> String {
    "10s".to_string()
}

fn default_coalesce_window() -> String {
    "100ms".to_string()
}

fn default_coalesce_max_batch() -> usize {
    200
}

fn default_rate_limit_per_sec() -> u32 {
    500
}

fn default_rate_limit_burst() -> u32 {
    200
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            coalesce_window: default_coalesce_window(),
            coalesce_max_batch: default_coalesce_max_batch(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl SubscriptionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        parse_or(&self.handshake_timeout, Duration::from_secs(10))
    }

    pub fn coalesce_window(&self) -> Duration {
        parse_or(&self.coalesce_window, Duration::from_millis(100))
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PushConfig: optimistic write delivery
// ═══════════════════════════════════════════════════════════════════════════════

/// Push retry and conflict settings.
///
/// Attempt N (0-indexed) waits `min(base_delay * 2^N, max_delay)` plus up to
/// `jitter`. After `max_attempts` transient failures in one push the row is
/// deferred to the next sync. After `conflict_budget` conflicts the mutation
/// is marked failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_jitter")]
    pub jitter: String,

    /// Bound on a single push round-trip.
    #[serde(default = "default_push_timeout")]
    pub push_timeout: String,

    #[serde(default = "default_conflict_budget")]
    pub conflict_budget: u32,

    /// Failure rate (0.0-1.0) over the window that opens the circuit.
    #[serde(default = "default_circuit_failure_rate")]
    pub circuit_failure_rate: f32,

    /// Calls observed before the circuit can trip.
    #[serde(default = "default_circuit_window")]
    pub circuit_window: usize,

    /// Time the circuit stays open before probing.
    #[serde(default = "default_circuit_recovery")]
    pub circuit_recovery: String,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> String {
    "100ms".to_string()
}

fn default_max_delay() -> String {
    "10s".to_string()
}

fn default_jitter() -> String {
    "50ms".to_string()
}

fn default_push_timeout() -> String {
    "10s".to_string()
}

fn default_conflict_budget() -> u32 {
    3
}

fn default_circuit_failure_rate() -> f32 {
    0.5
}

fn default_circuit_window() -> usize {
    20
}

fn default_circuit_recovery() -> String {
    "30s".to_string()
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            push_timeout: default_push_timeout(),
            conflict_budget: default_conflict_budget(),
            circuit_failure_rate: default_circuit_failure_rate(),
            circuit_window: default_circuit_window(),
            circuit_recovery: default_circuit_recovery(),
        }
    }
}

impl PushConfig {
    /// 100ms/200ms/400ms backoff with tiny jitter, circuit that won't trip in tests.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 4,
            base_delay: "100ms".into(),
            max_delay: "1s".into(),
            jitter: "5ms".into(),
            push_timeout: "1s".into(),
            conflict_budget: 3,
            circuit_failure_rate: 1.0,
            circuit_window: 1000,
            circuit_recovery: "100ms".into(),
        }
    }

    pub fn push_timeout(&self) -> Duration {
        parse_or(&self.push_timeout, Duration::from_secs(10))
    }

    pub fn circuit_recovery(&self) -> Duration {
        parse_or(&self.circuit_recovery, Duration::from_secs(30))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: parse_or(&self.base_delay, Duration::from_millis(100)),
            max_delay: parse_or(&self.max_delay, Duration::from_secs(10)),
            jitter: parse_or(&self.jitter, Duration::from_millis(50)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Eviction / backup / shutdown
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_eviction_interval")]
    pub interval: String,
}

fn default_eviction_interval() -> String {
    "5m".to_string()
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_eviction_interval(),
        }
    }
}

impl EvictionConfig {
    pub fn interval(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(300))
    }
}

/// Fallback store for debounced table snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Separate SQLite file so a corrupt main store doesn't take backups with it.
    #[serde(default = "default_backup_path")]
    pub sqlite_path: String,

    /// Requests within this window collapse into one write.
    #[serde(default = "default_backup_debounce")]
    pub debounce: String,

    /// Periodic snapshot cadence once auto-sync runs.
    #[serde(default = "default_backup_interval")]
    pub interval: String,
}

fn default_backup_path() -> String {
    "replica_backup.db".to_string()
}

fn default_backup_debounce() -> String {
    "2s".to_string()
}

fn default_backup_interval() -> String {
    "1m".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sqlite_path: default_backup_path(),
            debounce: default_backup_debounce(),
            interval: default_backup_interval(),
        }
    }
}

impl BackupConfig {
    pub fn debounce(&self) -> Duration {
        parse_or(&self.debounce, Duration::from_secs(2))
    }

    pub fn interval(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Bounded wait for in-flight transactions and tasks.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_drain_timeout() -> String {
    "5s".to_string()
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: local SQLite
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sqlite_path: String,

    /// Pool size. Tables transact independently, so more than one.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// SQLite busy_timeout.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,

    /// Bound on waiting for a table's transaction guard.
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout: String,
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

fn default_transaction_timeout() -> String {
    "10s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replica.db".to_string(),
            max_connections: default_max_connections(),
            busy_timeout: default_busy_timeout(),
            transaction_timeout: default_transaction_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            sqlite_path: dir.join("replica.db").to_string_lossy().to_string(),
            max_connections: 4,
            busy_timeout: "2s".into(),
            transaction_timeout: "1s".into(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        parse_or(&self.busy_timeout, Duration::from_secs(5))
    }

    pub fn transaction_timeout(&self) -> Duration {
        parse_or(&self.transaction_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EvictionPolicy;

    #[test]
    fn test_duration_parsing_various_formats() {
        let cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];
        for (input, expected) in cases {
            let config = SyncConfig {
                auto_sync_interval: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.auto_sync_interval(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = SyncConfig {
            fetch_timeout: "whenever".to_string(),
            ..Default::default()
        };
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_push_retry_config_from_strings() {
        let push = PushConfig::default();
        let retry = push.retry_config();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(10));
        assert_eq!(retry.jitter, Duration::from_millis(50));
    }

    #[test]
    fn test_zero_max_attempts_clamped() {
        let push = PushConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(push.retry_config().max_attempts, 1);
    }

    #[test]
    fn test_yaml_like_json_deserialization() {
        let json = r#"{
            "tenant_id": "club-1042",
            "settings": { "sync": { "auto_sync_interval": "15s" } },
            "tables": [
                { "name": "entries", "ttl": "12h", "backup": true },
                { "name": "classes", "eviction": { "kind": "lru", "max_records": 500 } }
            ],
            "store": { "sqlite_path": "/tmp/replica.db" }
        }"#;

        let config: ReplicationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tenant_id, "club-1042");
        assert_eq!(config.settings.sync.auto_sync_interval(), Duration::from_secs(15));
        assert_eq!(config.settings.sync.ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.tables.len(), 2);
        assert!(config.tables[0].backup);
        assert_eq!(config.tables[1].eviction, EvictionPolicy::Lru { max_records: 500 });
        assert_eq!(config.store.max_connections, 4);
        assert_eq!(config.settings.push.conflict_budget, 3);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = std::env::temp_dir();
        let config = ReplicationConfig::for_testing("t1", &dir)
            .with_table(TableRegistration::new("entries"));
        let json = serde_json::to_string(&config).unwrap();
        let back: ReplicationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tenant_id, "t1");
        assert_eq!(back.tables, config.tables);
        assert_eq!(back.store.sqlite_path, config.store.sqlite_path);
    }

    #[test]
    fn test_for_testing_paths_under_dir() {
        let dir = std::env::temp_dir().join("replica-cfg");
        let config = ReplicationConfig::for_testing("t1", &dir);
        assert!(config.store.sqlite_path.ends_with("replica.db"));
        assert!(config.settings.backup.sqlite_path.ends_with("backup.db"));
        assert_eq!(config.settings.sync.ready_timeout(), Duration::from_millis(200));
    }
}
