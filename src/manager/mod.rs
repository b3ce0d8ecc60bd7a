// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication manager.
//!
//! The orchestrator that ties together:
//! - Table replicas via [`crate::table::ReplicatedTable`]
//! - The pull/push protocol via [`crate::sync_engine::SyncEngine`]
//! - Realtime channels via [`crate::subscription::SubscriptionBridge`]
//! - Durable state via [`crate::store::LocalStore`] and [`crate::backup::BackupStore`]
//!
//! # Startup ordering
//!
//! 1. `register_table` opens each table and its channel; it never waits for
//!    the channel.
//! 2. `wait_for_subscriptions_ready` joins every readiness handle, bounded by
//!    a timeout. A degraded table does not fail the join.
//! 3. Only then can `start_auto_sync`, `sync_all` or `sync_table` run.
//!
//! # Shared state
//!
//! All per-table handles live in one [`ManagerContext`], passed explicitly to
//! every background task. Lifecycle changes (`register_table`, `shutdown`)
//! take the same lifecycle lock, so a shutdown can't interleave with a
//! registration halfway through opening its table.

mod scheduler;
mod types;

pub use types::{HealthCheck, ManagerState, ReadinessReport, TableHealthReport, TableState, TableSyncStatus};

use crate::backup::BackupStore;
use crate::config::{ReplicationConfig, ReplicationSettings};
use crate::diagnostics::{Collaborators, DiagnosticEvent};
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::record::{Payload, ReplicaRecord, TableRegistration};
use crate::remote::{NoOpRemote, RemoteStore, SubscriptionFilter};
use crate::store::LocalStore;
use crate::subscription::{Readiness, ReadinessHandle, SubscriptionBridge};
use crate::sync_engine::SyncEngine;
use crate::table::{LocalFilter, LocalSubscription, QueryResult, ReplicatedTable};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Table slots
// =============================================================================

/// A registered table plus the manager's bookkeeping for it.
pub(crate) struct TableSlot {
    table: Arc<ReplicatedTable>,
    state: Mutex<TableState>,
    syncing: AtomicBool,
    readiness: ReadinessHandle,
}

impl TableSlot {
    fn new(table: Arc<ReplicatedTable>, readiness: ReadinessHandle) -> Self {
        metrics::set_table_state(table.name(), TableState::Subscribing.as_str());
        Self {
            table,
            state: Mutex::new(TableState::Subscribing),
            syncing: AtomicBool::new(false),
            readiness,
        }
    }

    fn name(&self) -> &str {
        self.table.name()
    }

    fn state(&self) -> TableState {
        *self.state.lock()
    }

    fn set_state(&self, state: TableState) {
        *self.state.lock() = state;
        metrics::set_table_state(self.name(), state.as_str());
    }

    /// Move to `to` only from one of `from`.
    fn transition(&self, from: &[TableState], to: TableState) -> bool {
        let mut state = self.state.lock();
        if !from.contains(&state) {
            return false;
        }
        *state = to;
        metrics::set_table_state(self.table.name(), to.as_str());
        true
    }
}

/// Clears a slot's syncing flag when the sync ends, however it ends.
struct SyncFlag<'a>(&'a AtomicBool);

impl Drop for SyncFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything the manager and its background tasks share.
pub struct ManagerContext<R: RemoteStore> {
    tenant_id: String,
    settings: ReplicationSettings,
    txn_timeout: Duration,
    store: Arc<LocalStore>,
    backups: Option<Arc<BackupStore>>,
    tables: RwLock<BTreeMap<String, Arc<TableSlot>>>,
    engine: SyncEngine<R>,
    bridge: SubscriptionBridge<R>,
    collaborators: Collaborators,
    state_tx: watch::Sender<ManagerState>,
    shutdown_tx: watch::Sender<bool>,
    reconnect: Notify,
}

impl<R: RemoteStore> ManagerContext<R> {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn state(&self) -> ManagerState {
        *self.state_tx.borrow()
    }

    pub fn engine(&self) -> &SyncEngine<R> {
        &self.engine
    }

    pub fn bridge(&self) -> &SubscriptionBridge<R> {
        &self.bridge
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    fn set_state(&self, state: ManagerState) {
        self.state_tx.send_replace(state);
        metrics::set_manager_state(&state.to_string());
    }

    fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn slot(&self, name: &str) -> Result<Arc<TableSlot>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ReplicaError::TableNotRegistered(name.to_string()))
    }

    fn slots(&self) -> Vec<Arc<TableSlot>> {
        self.tables.read().values().cloned().collect()
    }

    /// Log, count and forward a per-table failure. Never propagates.
    fn report_table_error(&self, table: &str, operation: &'static str, error: &ReplicaError) {
        metrics::record_table_error(table, error.kind());
        self.collaborators.diagnostics.report(DiagnosticEvent::TableError {
            table: table.to_string(),
            operation,
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        });
    }

    /// Sync one table unless it is already syncing.
    async fn sync_slot(&self, slot: &TableSlot) -> TableSyncStatus {
        if slot
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::record_sync_coalesced(slot.name());
            debug!(table = %slot.name(), "Sync already in flight, trigger coalesced");
            return TableSyncStatus::Coalesced;
        }
        let _flag = SyncFlag(&slot.syncing);

        if slot.state() == TableState::Subscribing {
            // Registered after the barrier: this table waits for its own channel.
            let wait = self.settings.sync.ready_timeout();
            if tokio::time::timeout(wait, slot.readiness.wait()).await.is_err() {
                warn!(table = %slot.name(), "Subscription still connecting; syncing anyway");
            }
            slot.transition(&[TableState::Subscribing], TableState::Ready);
        }

        if !slot.transition(&[TableState::Ready, TableState::Idle], TableState::Syncing) {
            return failed_status(&ReplicaError::Shutdown);
        }

        let result = self.engine.sync_table(&slot.table).await;
        slot.transition(&[TableState::Syncing], TableState::Idle);

        match result {
            Ok(report) => TableSyncStatus::Synced(report),
            Err(ReplicaError::Shutdown) => failed_status(&ReplicaError::Shutdown),
            Err(e) => {
                self.report_table_error(slot.name(), "sync", &e);
                failed_status(&e)
            }
        }
    }

    /// Sync every table in parallel. Failures stay per table.
    async fn sync_all(&self) -> Vec<(String, TableSyncStatus)> {
        let slots = self.slots();
        join_all(slots.iter().map(|slot| async move {
            let status = self.sync_slot(slot).await;
            (slot.name().to_string(), status)
        }))
        .await
    }

    /// One eviction pass over every table with a policy.
    async fn evict_all(&self, now: DateTime<Utc>) -> usize {
        let slots: Vec<_> = self
            .slots()
            .into_iter()
            .filter(|s| !s.state().is_closed())
            .collect();
        let results = join_all(slots.iter().map(|slot| slot.table.evict_stale(now))).await;

        let mut evicted = 0;
        for (slot, result) in slots.iter().zip(results) {
            match result {
                Ok(report) => evicted += report.total(),
                Err(e) => self.report_table_error(slot.name(), "evict", &e),
            }
        }
        evicted
    }

    /// Debounced backup of every table that opts in.
    async fn backup_all(&self) {
        let slots = self.slots();
        let results = join_all(slots.iter().map(|slot| self.engine.backup_snapshot(&slot.table))).await;
        for (slot, result) in slots.iter().zip(results) {
            if let Err(e) = result {
                self.report_table_error(slot.name(), "backup", &e);
            }
        }
    }

    /// Seed an empty table from its verified backup. Failures are reported,
    /// never fatal: the next pull refills the table anyway.
    async fn restore_from_backup(&self, table: &ReplicatedTable) {
        let Some(backups) = &self.backups else {
            return;
        };
        if !table.is_empty() {
            return;
        }

        match backups.load(table.name()).await {
            Ok(Some(snapshot)) => {
                let age = Utc::now() - snapshot.snapshot_at;
                match table.restore_from_backup(snapshot.records).await {
                    Ok(0) => {}
                    Ok(restored) => info!(
                        table = %table.name(),
                        restored,
                        age_secs = age.num_seconds(),
                        "Table seeded from backup"
                    ),
                    Err(e) => self.report_table_error(table.name(), "restore_backup", &e),
                }
            }
            Ok(None) => debug!(table = %table.name(), "No backup snapshot to restore"),
            Err(e) => self.report_table_error(table.name(), "restore_backup", &e),
        }
    }
}

fn failed_status(error: &ReplicaError) -> TableSyncStatus {
    TableSyncStatus::Failed {
        kind: error.kind(),
        message: error.to_string(),
        retryable: error.is_retryable(),
    }
}

// =============================================================================
// Manager
// =============================================================================

/// The replication manager.
///
/// Owns the local store, every registered table, their realtime channels and
/// the background sync tasks for one tenant.
pub struct ReplicationManager<R: RemoteStore = NoOpRemote> {
    ctx: Arc<ManagerContext<R>>,

    /// Tables from the config, registered by `init()`.
    initial_tables: Vec<TableRegistration>,

    /// Held by `register_table` and `shutdown` for their whole duration.
    lifecycle: tokio::sync::Mutex<()>,

    /// Background task handles
    tasks: Mutex<Vec<JoinHandle<()>>>,

    state_rx: watch::Receiver<ManagerState>,
}

impl ReplicationManager<NoOpRemote> {
    /// Manager without a remote (offline use and tests).
    pub async fn offline(config: ReplicationConfig) -> Result<Self> {
        Self::open(config, Arc::new(NoOpRemote), Collaborators::default()).await
    }
}

impl<R: RemoteStore> ReplicationManager<R> {
    /// Open the local stores. The manager starts in `Initializing`.
    pub async fn open(config: ReplicationConfig, remote: Arc<R>, collaborators: Collaborators) -> Result<Self> {
        if config.tenant_id.trim().is_empty() {
            return Err(ReplicaError::Config("tenant_id must not be empty".to_string()));
        }

        info!(
            tenant = %config.tenant_id,
            tables = config.tables.len(),
            "Opening replication manager"
        );

        let store = Arc::new(LocalStore::open(&config.store).await?);
        let backups = if config.settings.backup.enabled {
            let backup = &config.settings.backup;
            Some(Arc::new(BackupStore::open(&backup.sqlite_path, backup.debounce()).await?))
        } else {
            None
        };

        let diagnostics = Arc::clone(&collaborators.diagnostics);
        let engine = SyncEngine::new(Arc::clone(&remote), &config.settings, backups.clone(), Arc::clone(&diagnostics));
        let bridge = SubscriptionBridge::new(remote, config.settings.subscription.clone(), diagnostics);

        let (state_tx, state_rx) = watch::channel(ManagerState::Initializing);
        let (shutdown_tx, _) = watch::channel(false);
        metrics::set_manager_state("Initializing");

        let ctx = ManagerContext {
            tenant_id: config.tenant_id,
            txn_timeout: config.store.transaction_timeout(),
            settings: config.settings,
            store,
            backups,
            tables: RwLock::new(BTreeMap::new()),
            engine,
            bridge,
            collaborators,
            state_tx,
            shutdown_tx,
            reconnect: Notify::new(),
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            initial_tables: config.tables,
            lifecycle: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            state_rx,
        })
    }

    pub fn context(&self) -> &Arc<ManagerContext<R>> {
        &self.ctx
    }

    pub fn state(&self) -> ManagerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ManagerState> {
        self.state_rx.clone()
    }

    pub fn tenant_id(&self) -> &str {
        &self.ctx.tenant_id
    }

    fn require_active(&self) -> Result<()> {
        match self.state() {
            ManagerState::Active => Ok(()),
            ManagerState::ShuttingDown | ManagerState::ShutDown => Err(ReplicaError::Shutdown),
            other => Err(ReplicaError::invalid_state(ManagerState::Active, other)),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register the configured tables, then wait for their subscriptions
    /// (bounded by `sync.ready_timeout`).
    ///
    /// A table that fails to open is reported and skipped. Tenant and
    /// configuration errors abort.
    pub async fn init(&self) -> Result<ReadinessReport> {
        for registration in self.initial_tables.clone() {
            let name = registration.name.clone();
            match self.register_table(registration).await {
                Ok(_) => {}
                Err(e @ (ReplicaError::TenantMismatch { .. } | ReplicaError::Config(_) | ReplicaError::Shutdown)) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(table = %name, error = %e, "Table failed to register; continuing without it");
                    self.ctx.report_table_error(&name, "register", &e);
                }
            }
        }
        self.wait_for_subscriptions_ready(self.ctx.settings.sync.ready_timeout())
            .await
    }

    /// Open a table and start its subscription. Returns without waiting for
    /// the channel; await the returned handle (or the barrier) for that.
    ///
    /// Registering a name twice returns the existing handle.
    pub async fn register_table(&self, registration: TableRegistration) -> Result<ReadinessHandle> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.state().accepts_work() {
            return Err(ReplicaError::Shutdown);
        }
        if let Some(tenant) = &registration.tenant_id {
            if tenant != &self.ctx.tenant_id {
                return Err(ReplicaError::TenantMismatch {
                    expected: self.ctx.tenant_id.clone(),
                    actual: tenant.clone(),
                });
            }
        }
        if let Some(slot) = self.ctx.tables.read().get(&registration.name) {
            return Ok(slot.readiness.clone());
        }

        let name = registration.name.clone();
        metrics::set_table_state(&name, TableState::Registering.as_str());
        info!(
            table = %name,
            realtime = registration.realtime,
            backup = registration.backup,
            eviction = registration.eviction.label(),
            "Registering table"
        );

        let table = Arc::new(
            ReplicatedTable::open(
                registration.clone(),
                &self.ctx.tenant_id,
                Arc::clone(&self.ctx.store),
                self.ctx.txn_timeout,
                self.ctx.collaborators.clone(),
            )
            .await?,
        );

        if registration.backup {
            self.ctx.restore_from_backup(&table).await;
        }

        let readiness = if registration.realtime {
            let filter = SubscriptionFilter::for_tenant(&self.ctx.tenant_id, registration.filter.as_deref());
            self.ctx.bridge.subscribe(Arc::clone(&table), filter)
        } else {
            ReadinessHandle::settled(&name, Readiness::Ready)
        };

        let count = {
            let mut tables = self.ctx.tables.write();
            tables.insert(name, Arc::new(TableSlot::new(table, readiness.clone())));
            tables.len()
        };
        metrics::set_registered_tables(count);
        Ok(readiness)
    }

    /// Join every table's readiness handle, bounded by `timeout`.
    ///
    /// Degraded tables don't fail the join. On timeout the manager proceeds
    /// anyway and names the tables still connecting.
    pub async fn wait_for_subscriptions_ready(&self, timeout: Duration) -> Result<ReadinessReport> {
        match self.state() {
            ManagerState::Initializing | ManagerState::WaitingForSubscriptions => {
                self.ctx.set_state(ManagerState::WaitingForSubscriptions);
            }
            ManagerState::Active => {}
            ManagerState::ShuttingDown | ManagerState::ShutDown => return Err(ReplicaError::Shutdown),
        }

        let slots = self.ctx.slots();
        let start = Instant::now();
        let timed_out = tokio::time::timeout(timeout, join_all(slots.iter().map(|s| s.readiness.wait())))
            .await
            .is_err();

        let mut report = ReadinessReport {
            timed_out,
            elapsed: start.elapsed(),
            ..Default::default()
        };
        for slot in &slots {
            let name = slot.name().to_string();
            match slot.readiness.peek() {
                Some(Readiness::Ready) => report.ready.push(name),
                Some(Readiness::Degraded(reason)) => report.degraded.push((name, reason)),
                None => report.pending.push(name),
            }
            slot.transition(&[TableState::Subscribing], TableState::Ready);
        }

        if timed_out {
            warn!(
                pending = ?report.pending,
                timeout_ms = timeout.as_millis() as u64,
                "Subscriptions not ready in time; proceeding"
            );
            self.ctx.collaborators.diagnostics.report(DiagnosticEvent::ReadinessTimedOut {
                pending: report.pending.clone(),
            });
        }
        metrics::record_readiness_barrier(
            report.ready.len(),
            report.degraded.len(),
            report.pending.len(),
            report.elapsed,
        );

        // Shutdown may have begun while we waited.
        let activated = self.ctx.state_tx.send_if_modified(|state| {
            if *state == ManagerState::WaitingForSubscriptions {
                *state = ManagerState::Active;
                return true;
            }
            false
        });
        if activated {
            metrics::set_manager_state("Active");
        }

        info!(
            ready = report.ready.len(),
            degraded = report.degraded.len(),
            pending = report.pending.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Subscription barrier passed"
        );
        Ok(report)
    }

    /// Spawn the periodic, reconnect, eviction and backup tasks.
    ///
    /// Only valid once the barrier has passed. Calling it again is a no-op.
    pub fn start_auto_sync(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        self.require_active()?;
        if !tasks.is_empty() {
            debug!("Auto sync already running");
            return Ok(());
        }

        let settings = &self.ctx.settings;
        tasks.push(scheduler::spawn_periodic_sync(
            Arc::clone(&self.ctx),
            settings.sync.auto_sync_interval(),
        ));
        if settings.sync.reconnect_sync {
            tasks.push(scheduler::spawn_reconnect_sync(Arc::clone(&self.ctx)));
        }
        if settings.eviction.enabled {
            tasks.push(scheduler::spawn_eviction(Arc::clone(&self.ctx), settings.eviction.interval()));
        }
        if settings.backup.enabled && self.ctx.backups.is_some() {
            tasks.push(scheduler::spawn_backup(Arc::clone(&self.ctx), settings.backup.interval()));
        }

        info!(
            tasks = tasks.len(),
            interval_ms = settings.sync.auto_sync_interval().as_millis() as u64,
            "Auto sync started"
        );
        Ok(())
    }

    /// Shut down gracefully. Idempotent.
    ///
    /// 1. Signal background tasks and wait for them (bounded)
    /// 2. Wait for each table's in-flight transaction (bounded), then close it
    /// 3. Close every channel
    /// 4. Flush backups without debounce
    /// 5. Checkpoint and close the stores
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.state().accepts_work() {
            debug!("Shutdown already done");
            return;
        }

        info!(tenant = %self.ctx.tenant_id, "Shutting down replication manager");
        self.ctx.set_state(ManagerState::ShuttingDown);
        let _ = self.ctx.shutdown_tx.send(true);
        let drain = self.ctx.settings.shutdown.drain_timeout();

        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for background tasks to stop");
        }
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        let slots = self.ctx.slots();
        for slot in &slots {
            slot.set_state(TableState::Closing);
        }
        let drained = join_all(slots.iter().map(|slot| slot.table.close(drain))).await;
        let stuck = drained.iter().filter(|d| !**d).count();
        if stuck > 0 {
            warn!(tables = stuck, "Tables closed with transactions still in flight");
        }

        self.ctx.bridge.unsubscribe_all(drain).await;

        for slot in &slots {
            if let Err(e) = self.ctx.engine.flush_backup(&slot.table).await {
                self.ctx.report_table_error(slot.name(), "backup", &e);
            }
            slot.set_state(TableState::Closed);
        }

        if let Some(backups) = &self.ctx.backups {
            backups.close().await;
        }
        if let Err(e) = self.ctx.store.checkpoint().await {
            warn!(error = %e, "WAL checkpoint failed during shutdown");
        }
        self.ctx.store.close().await;

        self.ctx.set_state(ManagerState::ShutDown);
        info!("Replication manager shut down");
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Sync every table in parallel. One table's failure is reported and
    /// returned in its status; it never fails the call.
    pub async fn sync_all(&self) -> Result<Vec<(String, TableSyncStatus)>> {
        self.require_active()?;
        Ok(self.ctx.sync_all().await)
    }

    /// Sync one table. A trigger arriving mid-sync is coalesced.
    pub async fn sync_table(&self, name: &str) -> Result<TableSyncStatus> {
        self.require_active()?;
        let slot = self.ctx.slot(name)?;
        Ok(self.ctx.sync_slot(&slot).await)
    }

    /// The host regained connectivity. Wakes the reconnect task.
    pub fn notify_reconnect(&self) {
        debug!("Reconnect reported");
        self.ctx.reconnect.notify_one();
    }

    // =========================================================================
    // Domain facade
    // =========================================================================

    pub fn table(&self, name: &str) -> Result<Arc<ReplicatedTable>> {
        self.ctx.slot(name).map(|slot| Arc::clone(&slot.table))
    }

    /// `Unregistered` for unknown names.
    pub fn table_state(&self, name: &str) -> TableState {
        self.ctx
            .slot(name)
            .map(|slot| slot.state())
            .unwrap_or(TableState::Unregistered)
    }

    pub fn tables(&self) -> Vec<String> {
        self.ctx.tables.read().keys().cloned().collect()
    }

    pub fn get(&self, table: &str, key: &str) -> Result<Option<ReplicaRecord>> {
        Ok(self.table(table)?.get(key))
    }

    pub fn query<F>(&self, table: &str, predicate: F) -> Result<QueryResult>
    where
        F: Fn(&ReplicaRecord) -> bool + Send + Sync + 'static,
    {
        Ok(self.table(table)?.query(predicate))
    }

    pub async fn put(&self, table: &str, key: &str, payload: Payload) -> Result<ReplicaRecord> {
        self.table(table)?.put(key, payload).await
    }

    pub async fn delete(&self, table: &str, key: &str) -> Result<bool> {
        self.table(table)?.delete(key).await
    }

    pub fn subscribe_local(&self, table: &str, filter: LocalFilter) -> Result<LocalSubscription> {
        Ok(self.table(table)?.subscribe_local(filter))
    }

    /// Scan the table's durable rows inside a transaction bounded by `timeout`.
    ///
    /// On timeout the transaction is rolled back explicitly and the table's
    /// guard released before the error is returned.
    pub async fn query_with_timeout<F>(&self, table: &str, predicate: F, timeout: Duration) -> Result<Vec<ReplicaRecord>>
    where
        F: Fn(&ReplicaRecord) -> bool,
    {
        let table = self.table(table)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let operation = format!("query {}", table.name());

        let mut txn = match tokio::time::timeout_at(deadline, table.begin()).await {
            Ok(txn) => txn?,
            Err(_) => return Err(ReplicaError::timeout(operation, timeout)),
        };

        match tokio::time::timeout_at(deadline, txn.scan(predicate)).await {
            Ok(Ok(rows)) => {
                txn.commit().await?;
                Ok(rows)
            }
            Ok(Err(e)) => {
                if let Err(abort) = txn.abort().await {
                    warn!(table = %table.name(), error = %abort, "Rollback after failed query failed");
                }
                Err(e)
            }
            Err(_) => {
                if let Err(abort) = txn.abort().await {
                    warn!(table = %table.name(), error = %abort, "Rollback after query timeout failed");
                }
                debug!(table = %table.name(), timeout_ms = timeout.as_millis() as u64, "Query timed out, transaction aborted");
                Err(ReplicaError::timeout(operation, timeout))
            }
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Get comprehensive health status for monitoring endpoints.
    ///
    /// Performs no network or storage I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let tables: Vec<TableHealthReport> = self
            .ctx
            .slots()
            .iter()
            .map(|slot| {
                let handle = self.ctx.bridge.handle(slot.name());
                TableHealthReport {
                    state: slot.state(),
                    health: slot.table.health(),
                    degraded: handle.as_ref().is_some_and(|h| h.is_degraded()),
                    subscription: handle.map(|h| h.status),
                }
            })
            .collect();

        let degraded_tables = tables.iter().filter(|t| t.degraded).count();
        let failed_mutations = tables.iter().map(|t| t.health.failed).sum::<usize>();
        let ready = state == ManagerState::Active;

        HealthCheck {
            state,
            ready,
            healthy: ready && degraded_tables == 0 && failed_mutations == 0,
            tables,
            degraded_tables,
            failed_mutations,
            circuit: self.ctx.engine.circuit().metrics(),
        }
    }
}
