// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Replica Engine
//!
//! Client-side replication for offline-capable, multi-tenant apps. Each
//! registered table is kept as a local replica that serves reads instantly,
//! accepts writes offline, and converges with the remote store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          ReplicationManager                               │
//! │                                                                           │
//! │  ┌──────────────────┐   pull / push   ┌──────────────┐                    │
//! │  │ ReplicatedTable  │◄───────────────►│  SyncEngine  │◄──► RemoteStore    │
//! │  │ (snapshot+queue) │                 │ (circuits)   │                    │
//! │  └──────────────────┘                 └──────────────┘                    │
//! │         ▲      │                                                          │
//! │  events │      ▼                                                          │
//! │  ┌──────────────────┐                 ┌──────────────┐                    │
//! │  │SubscriptionBridge│                 │  LocalStore  │  BackupStore       │
//! │  │ (coalesced feed) │                 │ (SQLite WAL) │  (snapshots)       │
//! │  └──────────────────┘                 └──────────────┘                    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Startup
//!
//! Tables register and open their realtime channels first. The manager then
//! waits (bounded) for every channel to report subscribed or degraded before
//! any sync runs, so no change can fall between the first pull and the
//! first event.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replica_engine::{ReplicationConfig, ReplicationManager, TableRegistration};
//!
//! #[tokio::main]
//! async fn main() -> replica_engine::Result<()> {
//!     let config = ReplicationConfig::default()
//!         .with_table(TableRegistration::new("entries"))
//!         .with_table(TableRegistration::new("classes").with_realtime(false));
//!
//!     let manager = ReplicationManager::offline(config).await?;
//!     let readiness = manager.init().await?;
//!     if !readiness.all_settled() {
//!         eprintln!("still connecting: {:?}", readiness.pending);
//!     }
//!     manager.start_auto_sync()?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod circuit_breaker;
pub mod coalesce;
pub mod config;
pub mod cursor;
pub mod diagnostics;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod mutation;
pub mod record;
pub mod remote;
pub mod resilience;
pub mod store;
pub mod subscription;
pub mod sync_engine;
pub mod table;

// Re-exports for convenience
pub use backup::{BackupOutcome, BackupSnapshot, BackupStore};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitMetrics, RemoteCircuit};
pub use config::{
    BackupConfig, EvictionConfig, PushConfig, ReplicationConfig, ReplicationSettings, ShutdownConfig, StoreConfig,
    SubscriptionConfig, SyncConfig,
};
pub use diagnostics::{Collaborators, DiagnosticEvent, DiagnosticsSink, TracingDiagnostics, TtlPolicyProvider};
pub use error::{ReplicaError, Result};
pub use manager::{
    HealthCheck, ManagerContext, ManagerState, ReadinessReport, ReplicationManager, TableHealthReport, TableState,
    TableSyncStatus,
};
pub use mutation::{LockToken, PendingMutation};
pub use record::{EvictionPolicy, Payload, ReplicaRecord, TableRegistration, Watermark};
pub use remote::{
    ChannelHandle, ChannelStatus, NoOpRemote, PushOutcome, RemoteChannel, RemoteError, RemoteEvent, RemoteOp, RemotePush,
    RemoteRecord, RemoteScope, RemoteStore, SubscriptionFilter,
};
pub use store::LocalStore;
pub use subscription::{Readiness, ReadinessHandle, SubscriptionBridge, SubscriptionHandle};
pub use sync_engine::{PushReport, PushResult, SyncEngine, TableSyncReport};
pub use table::{
    ApplyResult, ChangeKind, ChangeOrigin, LocalChange, LocalFilter, LocalSubscription, QueryResult, ReplicatedTable,
    TableHealth,
};
