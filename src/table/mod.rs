// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replicated table.
//!
//! [`ReplicatedTable`] is the authoritative local view of one remote table.
//! It keeps the rows in memory as a copy-on-write snapshot and mirrors every
//! change into the [`LocalStore`](crate::store::LocalStore).
//!
//! # Single-flight
//!
//! Every storage-mutating operation (local write, remote apply, eviction,
//! mutation bookkeeping, explicit transaction) holds the table's guard for
//! its whole SQLite transaction:
//!
//! ```text
//! acquire guard (bounded) → plan against memory → BEGIN … COMMIT → swap memory → release
//! ```
//!
//! A failed transaction rolls back and leaves memory untouched. Other tables
//! have their own guards and proceed in parallel.
//!
//! # Reads
//!
//! `get` and `query` never take the guard and never touch the network. They
//! read the current `Arc` snapshot; writers build a new map with
//! `Arc::make_mut`, so a snapshot already handed out never changes.
//!
//! # Dirty rows
//!
//! A row is dirty while it has a [`PendingMutation`]. Remote deltas for a
//! dirty row rebase the local intent instead of overwriting it, and eviction
//! never selects it.

mod eviction;
mod query;

pub use eviction::EvictionReport;
pub use query::{
    ChangeKind, ChangeOrigin, LocalChange, LocalFilter, LocalSubscription, Predicate, QueryResult, Snapshot,
    TableTransaction,
};

use crate::cursor::SyncCursor;
use crate::diagnostics::{Collaborators, DiagnosticEvent};
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::mutation::{LockToken, MutationStatus, PendingMutation, RowClaim, RowLocks};
use crate::record::{rebase, Payload, ReplicaRecord, TableRegistration, Watermark};
use crate::remote::{RemoteEvent, RemoteRecord, RemoteScope};
use crate::resilience::SingleFlight;
use crate::store::{now_ms, LocalStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit};
use tracing::{debug, info, warn};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Outcome of applying remote rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// Rows inserted or updated from the server.
    pub applied: usize,
    /// Rows already at (or past) the incoming state.
    pub skipped: usize,
    /// Dirty rows whose local intent was rebased onto the incoming state.
    pub rebased: usize,
    /// Rows removed by remote tombstones.
    pub deleted: usize,
    /// Cursor after the apply.
    pub cursor: Watermark,
}

/// Point-in-time health of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHealth {
    pub table: String,
    pub records: usize,
    pub dirty: usize,
    pub pending: usize,
    pub failed: usize,
    pub cursor: Watermark,
    pub guard_held: bool,
    pub claimed_rows: usize,
}

/// Staged row, mutation and cursor changes for one transaction.
#[derive(Debug, Default)]
struct TableWrite {
    rows: BTreeMap<String, Option<ReplicaRecord>>,
    mutations: BTreeMap<String, Option<PendingMutation>>,
    cursor: Option<Watermark>,
}

impl TableWrite {
    fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.mutations.is_empty() && self.cursor.is_none()
    }
}

/// The local replica of one remote table.
pub struct ReplicatedTable {
    registration: TableRegistration,
    tenant_id: String,
    store: Arc<LocalStore>,
    guard: SingleFlight,
    txn_timeout: Duration,
    replica: RwLock<Snapshot>,
    cursor: Mutex<SyncCursor>,
    pending: Mutex<BTreeMap<String, PendingMutation>>,
    locks: RowLocks,
    /// Last read time per key, millis. Feeds LRU eviction.
    access: DashMap<String, i64>,
    changes: broadcast::Sender<LocalChange>,
    collaborators: Collaborators,
}

impl ReplicatedTable {
    /// Load (or create) the table's durable state.
    pub async fn open(
        registration: TableRegistration,
        tenant_id: &str,
        store: Arc<LocalStore>,
        txn_timeout: Duration,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let name = registration.name.clone();
        let ttl = collaborators.ttl_policy.ttl_for(&registration);
        store.register_meta(&registration, ttl).await?;

        let records = store.load_records(&name).await?;
        let cursor = store.load_cursor(&name).await?.unwrap_or(0);
        let mutations = store.load_mutations(&name).await?;
        let max_generation = mutations.iter().map(|m| m.generation).max().unwrap_or(0);

        info!(
            table = %name,
            records = records.len(),
            pending = mutations.len(),
            cursor,
            "Replicated table opened"
        );

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let table = Self {
            guard: SingleFlight::new(name.clone()),
            replica: RwLock::new(Arc::new(records.into_iter().map(|r| (r.key.clone(), r)).collect())),
            cursor: Mutex::new(SyncCursor {
                table: name.clone(),
                watermark: cursor,
            }),
            pending: Mutex::new(mutations.into_iter().map(|m| (m.key.clone(), m)).collect()),
            locks: RowLocks::new(max_generation),
            access: DashMap::new(),
            changes,
            registration,
            tenant_id: tenant_id.to_string(),
            store,
            txn_timeout,
            collaborators,
        };
        table.publish_mutation_gauge();
        metrics::set_cursor(table.name(), cursor);
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.registration.name
    }

    pub fn registration(&self) -> &TableRegistration {
        &self.registration
    }

    /// Tenant + table scope for remote calls.
    pub fn scope(&self) -> RemoteScope {
        RemoteScope {
            tenant_id: self.tenant_id.clone(),
            table: self.registration.name.clone(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &str) -> Option<ReplicaRecord> {
        let record = self.replica.read().get(key).cloned();
        if record.is_some() {
            self.access.insert(key.to_string(), now_ms());
        }
        record
    }

    pub fn query<F>(&self, predicate: F) -> QueryResult
    where
        F: Fn(&ReplicaRecord) -> bool + Send + Sync + 'static,
    {
        QueryResult::new(self.snapshot(), Arc::new(predicate))
    }

    pub fn snapshot(&self) -> Snapshot {
        self.replica.read().clone()
    }

    pub fn len(&self) -> usize {
        self.replica.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replica.read().is_empty()
    }

    pub fn cursor(&self) -> Watermark {
        self.cursor.lock().watermark
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Optimistic local write. The row is visible immediately and marked
    /// dirty until the remote confirms it.
    pub async fn put(&self, key: &str, mut payload: Payload) -> Result<ReplicaRecord> {
        let permit = self.guard.acquire(self.txn_timeout).await?;

        let pk = &self.registration.primary_key;
        if !payload.contains_key(pk) {
            payload.insert(pk.clone(), Value::String(key.to_string()));
        }

        let current = self.replica.read().get(key).cloned();
        let existing = self.pending.lock().get(key).cloned();
        let generation = self.locks.next_generation();

        let mutation = match existing {
            Some(previous) => PendingMutation {
                desired: Some(payload.clone()),
                attempts: 0,
                conflicts: 0,
                generation,
                status: MutationStatus::Pending,
                ..previous
            },
            None => PendingMutation {
                key: key.to_string(),
                desired: Some(payload.clone()),
                base: current.as_ref().map(|r| r.payload.clone()),
                base_watermark: current.as_ref().map_or(0, |r| r.watermark),
                attempts: 0,
                conflicts: 0,
                generation,
                status: MutationStatus::Pending,
            },
        };

        let record = ReplicaRecord {
            key: key.to_string(),
            payload,
            watermark: mutation.base_watermark,
            dirty: true,
            synced_at: current.and_then(|r| r.synced_at),
        };

        let mut write = TableWrite::default();
        write.rows.insert(key.to_string(), Some(record.clone()));
        write.mutations.insert(key.to_string(), Some(mutation));
        self.commit_write(&permit, write).await?;

        debug!(table = %self.name(), key = %key, generation, "Local put");
        self.emit(key, ChangeKind::Upserted, ChangeOrigin::Local, Some(record.clone()));
        Ok(record)
    }

    /// Optimistic local delete. `false` if the row does not exist.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let permit = self.guard.acquire(self.txn_timeout).await?;

        let Some(current) = self.replica.read().get(key).cloned() else {
            return Ok(false);
        };
        let existing = self.pending.lock().get(key).cloned();

        let mut write = TableWrite::default();
        write.rows.insert(key.to_string(), None);

        match existing {
            // Never pushed and nobody is pushing it: nothing to tell the remote.
            Some(previous) if previous.is_local_insert() && !self.locks.is_claimed(key) => {
                write.mutations.insert(key.to_string(), None);
            }
            Some(previous) => {
                let mutation = PendingMutation {
                    desired: None,
                    attempts: 0,
                    conflicts: 0,
                    generation: self.locks.next_generation(),
                    status: MutationStatus::Pending,
                    ..previous
                };
                write.mutations.insert(key.to_string(), Some(mutation));
            }
            None => {
                let mutation = PendingMutation {
                    key: key.to_string(),
                    desired: None,
                    base: Some(current.payload.clone()),
                    base_watermark: current.watermark,
                    attempts: 0,
                    conflicts: 0,
                    generation: self.locks.next_generation(),
                    status: MutationStatus::Pending,
                };
                write.mutations.insert(key.to_string(), Some(mutation));
            }
        }

        self.commit_write(&permit, write).await?;
        debug!(table = %self.name(), key = %key, "Local delete");
        self.emit(key, ChangeKind::Deleted, ChangeOrigin::Local, Some(current));
        Ok(true)
    }

    // =========================================================================
    // Remote apply
    // =========================================================================

    /// Apply a pulled batch and advance the cursor to `watermark` (or the
    /// batch's highest watermark) in the same transaction.
    ///
    /// Idempotent: rows already at the incoming state are skipped.
    pub async fn apply_remote_batch(&self, records: Vec<RemoteRecord>, watermark: Watermark) -> Result<ApplyResult> {
        self.apply_records(records, Some(watermark)).await
    }

    /// Apply coalesced realtime events. Never moves the cursor.
    pub async fn apply_remote_events(&self, events: Vec<RemoteEvent>) -> Result<ApplyResult> {
        let records = events.into_iter().map(RemoteEvent::into_record).collect();
        self.apply_records(records, None).await
    }

    async fn apply_records(&self, mut records: Vec<RemoteRecord>, advance_to: Option<Watermark>) -> Result<ApplyResult> {
        records.sort_by_key(|r| r.watermark);
        let batch_max = records.iter().map(|r| r.watermark).max();

        let permit = self.guard.acquire(self.txn_timeout).await?;

        let snapshot = self.snapshot();
        let mut pending = self.pending.lock().clone();
        let now = now_ms();
        let mut result = ApplyResult::default();
        let mut write = TableWrite::default();

        for incoming in records {
            let key = incoming.key.clone();
            let current = match write.rows.get(&key) {
                Some(staged) => staged.clone(),
                None => snapshot.get(&key).cloned(),
            };

            if let Some(mutation) = pending.get_mut(&key) {
                if incoming.watermark <= mutation.base_watermark {
                    result.skipped += 1;
                    continue;
                }
                if incoming.deleted && mutation.is_delete() {
                    // Both sides want it gone.
                    pending.remove(&key);
                    write.mutations.insert(key, None);
                    result.deleted += 1;
                    continue;
                }

                let old_base = mutation.base.take();
                if !incoming.deleted {
                    mutation.desired = rebase(old_base.as_ref(), mutation.desired.as_ref(), Some(&incoming.payload));
                    mutation.base = Some(incoming.payload.clone());
                }
                mutation.base_watermark = incoming.watermark;
                // Invalidates any push still carrying the pre-rebase intent.
                mutation.generation = self.locks.next_generation();

                if let Some(desired) = &mutation.desired {
                    write.rows.insert(
                        key.clone(),
                        Some(ReplicaRecord {
                            key: key.clone(),
                            payload: desired.clone(),
                            watermark: incoming.watermark,
                            dirty: true,
                            synced_at: Some(now),
                        }),
                    );
                }
                write.mutations.insert(key, Some(mutation.clone()));
                result.rebased += 1;
                continue;
            }

            let stale = current.as_ref().is_some_and(|existing| {
                incoming.watermark < existing.watermark
                    || (incoming.watermark == existing.watermark
                        && !incoming.deleted
                        && existing.payload == incoming.payload)
            });
            if stale {
                result.skipped += 1;
                continue;
            }

            if incoming.deleted {
                if current.is_some() {
                    write.rows.insert(key, None);
                    result.deleted += 1;
                } else {
                    result.skipped += 1;
                }
            } else {
                let record = ReplicaRecord::from_server(key.clone(), incoming.payload, incoming.watermark, now);
                write.rows.insert(key, Some(record));
                result.applied += 1;
            }
        }

        let target = advance_to.map(|w| batch_max.map_or(w, |m| w.max(m)));
        write.cursor = target.filter(|w| self.cursor.lock().would_advance(*w));

        let emitted: Vec<(String, Option<ReplicaRecord>)> = write
            .rows
            .iter()
            .map(|(key, row)| (key.clone(), row.clone().or_else(|| snapshot.get(key).cloned())))
            .collect();
        let removed: Vec<bool> = write.rows.values().map(Option::is_none).collect();

        self.commit_write(&permit, write).await?;
        drop(permit);

        for ((key, record), removed) in emitted.into_iter().zip(removed) {
            let kind = if removed { ChangeKind::Deleted } else { ChangeKind::Upserted };
            self.emit(&key, kind, ChangeOrigin::Remote, record);
        }

        result.cursor = self.cursor();
        debug!(
            table = %self.name(),
            applied = result.applied,
            skipped = result.skipped,
            rebased = result.rebased,
            deleted = result.deleted,
            cursor = result.cursor,
            "Remote rows applied"
        );
        Ok(result)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Drop stale (TTL) and excess (LRU) clean rows.
    ///
    /// Snapshots already handed out by `query` keep the rows they saw.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> Result<EvictionReport> {
        let policy = self.registration.eviction;
        let ttl = self.collaborators.ttl_policy.ttl_for(&self.registration);

        let permit = self.guard.acquire(self.txn_timeout).await?;
        let snapshot = self.snapshot();
        let plan = {
            let pending = self.pending.lock();
            eviction::plan_evictions(
                &snapshot,
                |key| pending.contains_key(key),
                policy,
                ttl,
                now.timestamp_millis(),
                |key| self.access.get(key).map(|t| *t),
            )
        };

        if plan.is_empty() {
            return Ok(EvictionReport::default());
        }

        let mut write = TableWrite::default();
        for key in plan.keys() {
            write.rows.insert(key.clone(), None);
        }
        self.commit_write(&permit, write).await?;
        drop(permit);

        for key in plan.keys() {
            self.emit(key, ChangeKind::Evicted, ChangeOrigin::Eviction, snapshot.get(key).cloned());
        }

        let report = plan.report();
        metrics::record_eviction(self.name(), report.ttl_evicted, report.lru_evicted);
        info!(
            table = %self.name(),
            ttl_evicted = report.ttl_evicted,
            lru_evicted = report.lru_evicted,
            remaining = self.len(),
            "Evicted rows"
        );
        Ok(report)
    }

    // =========================================================================
    // Transactions and feeds
    // =========================================================================

    /// Open an explicit read transaction holding the table's guard.
    pub async fn begin(&self) -> Result<TableTransaction> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        let tx = self.store.begin(self.name()).await?;
        Ok(TableTransaction::new(tx, permit))
    }

    pub fn subscribe_local(&self, filter: LocalFilter) -> LocalSubscription {
        LocalSubscription::new(self.name().to_string(), self.changes.subscribe(), filter)
    }

    // =========================================================================
    // Pending mutations
    // =========================================================================

    /// Mutations waiting to be pushed, oldest write first.
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        let mut list: Vec<_> = self
            .pending
            .lock()
            .values()
            .filter(|m| !m.is_failed())
            .cloned()
            .collect();
        list.sort_by_key(|m| m.generation);
        list
    }

    pub fn failed_mutations(&self) -> Vec<PendingMutation> {
        self.pending.lock().values().filter(|m| m.is_failed()).cloned().collect()
    }

    pub fn mutation_for(&self, key: &str) -> Option<PendingMutation> {
        self.pending.lock().get(key).cloned()
    }

    /// Exclusive push rights for a row. `LockBusy` if another push holds it.
    pub fn claim_row(&self, key: &str) -> Result<RowClaim> {
        self.locks.claim(key).ok_or_else(|| ReplicaError::LockBusy {
            table: self.name().to_string(),
            key: key.to_string(),
        })
    }

    /// The mutation `token` names, if it is still the row's current intent.
    fn current_mutation(&self, token: &LockToken) -> Option<PendingMutation> {
        let pending = self.pending.lock();
        pending.get(&token.key).filter(|m| token.is_current(Some(m))).cloned()
    }

    /// The remote accepted the push: the row becomes clean at `watermark`.
    ///
    /// `false` (and no change) if a newer write superseded the token.
    pub async fn confirm_mutation(&self, token: &LockToken, watermark: Watermark) -> Result<bool> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        let Some(mutation) = self.current_mutation(token) else {
            return Ok(false);
        };

        let row = mutation
            .desired
            .map(|payload| ReplicaRecord::from_server(token.key.clone(), payload, watermark, now_ms()));

        let mut write = TableWrite::default();
        write.rows.insert(token.key.clone(), row.clone());
        write.mutations.insert(token.key.clone(), None);
        self.commit_write(&permit, write).await?;
        drop(permit);

        self.emit(&token.key, ChangeKind::Confirmed, ChangeOrigin::Push, row);
        Ok(true)
    }

    /// The push conflicted: re-apply the local intent on top of `server`.
    ///
    /// Returns the rebased mutation, or `None` if the token was superseded
    /// or the conflict resolved the intent (both sides deleted the row).
    pub async fn rebase_mutation(
        &self,
        token: &LockToken,
        server: Option<RemoteRecord>,
    ) -> Result<Option<PendingMutation>> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        let Some(mut mutation) = self.current_mutation(token) else {
            return Ok(None);
        };

        let server = server.filter(|r| !r.deleted);
        let mut write = TableWrite::default();

        if mutation.is_delete() && server.is_none() {
            write.mutations.insert(token.key.clone(), None);
            self.commit_write(&permit, write).await?;
            return Ok(None);
        }

        mutation.conflicts += 1;
        match server {
            Some(server) => {
                mutation.desired = rebase(mutation.base.as_ref(), mutation.desired.as_ref(), Some(&server.payload));
                mutation.base = Some(server.payload);
                mutation.base_watermark = server.watermark;
            }
            None => {
                // Row is gone remotely; push again as an insert.
                mutation.base = None;
                mutation.base_watermark = 0;
            }
        }

        let row = mutation.desired.as_ref().map(|desired| ReplicaRecord {
            key: token.key.clone(),
            payload: desired.clone(),
            watermark: mutation.base_watermark,
            dirty: true,
            synced_at: Some(now_ms()),
        });
        write.rows.insert(token.key.clone(), row.clone());
        write.mutations.insert(token.key.clone(), Some(mutation.clone()));
        self.commit_write(&permit, write).await?;
        drop(permit);

        debug!(
            table = %self.name(),
            key = %token.key,
            conflicts = mutation.conflicts,
            base_watermark = mutation.base_watermark,
            "Mutation rebased after conflict"
        );
        if row.is_some() {
            self.emit(&token.key, ChangeKind::Upserted, ChangeOrigin::Push, row);
        }
        Ok(Some(mutation))
    }

    /// Count one transient push failure. `None` if superseded.
    pub async fn record_attempt(&self, token: &LockToken) -> Result<Option<PendingMutation>> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        let Some(mut mutation) = self.current_mutation(token) else {
            return Ok(None);
        };
        mutation.attempts += 1;

        let mut write = TableWrite::default();
        write.mutations.insert(token.key.clone(), Some(mutation.clone()));
        self.commit_write(&permit, write).await?;
        Ok(Some(mutation))
    }

    /// Give up on a mutation. It stays (with its dirty row) until retried or
    /// discarded. `false` if superseded.
    pub async fn fail_mutation(&self, token: &LockToken, reason: &str) -> Result<bool> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        let Some(mut mutation) = self.current_mutation(token) else {
            return Ok(false);
        };
        mutation.status = MutationStatus::Failed {
            reason: reason.to_string(),
        };

        let mut write = TableWrite::default();
        write.mutations.insert(token.key.clone(), Some(mutation));
        self.commit_write(&permit, write).await?;
        drop(permit);

        warn!(table = %self.name(), key = %token.key, reason = %reason, "Mutation failed");
        let record = self.replica.read().get(&token.key).cloned();
        self.emit(&token.key, ChangeKind::MutationFailed, ChangeOrigin::Push, record);
        self.collaborators.diagnostics.report(DiagnosticEvent::MutationFailed {
            table: self.name().to_string(),
            key: token.key.clone(),
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Re-queue a failed mutation with a fresh attempt budget.
    pub async fn retry_failed(&self, key: &str) -> Result<bool> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        let Some(mut mutation) = self.pending.lock().get(key).filter(|m| m.is_failed()).cloned() else {
            return Ok(false);
        };
        mutation.status = MutationStatus::Pending;
        mutation.attempts = 0;
        mutation.conflicts = 0;
        mutation.generation = self.locks.next_generation();

        let mut write = TableWrite::default();
        write.mutations.insert(key.to_string(), Some(mutation));
        self.commit_write(&permit, write).await?;
        info!(table = %self.name(), key = %key, "Failed mutation re-queued");
        Ok(true)
    }

    /// Drop a failed mutation and revert the row to its last server state.
    pub async fn discard_failed(&self, key: &str) -> Result<bool> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        let Some(mutation) = self.pending.lock().get(key).filter(|m| m.is_failed()).cloned() else {
            return Ok(false);
        };

        let reverted = mutation
            .base
            .map(|base| ReplicaRecord::from_server(key, base, mutation.base_watermark, now_ms()));

        let mut write = TableWrite::default();
        write.rows.insert(key.to_string(), reverted.clone());
        write.mutations.insert(key.to_string(), None);
        self.commit_write(&permit, write).await?;
        drop(permit);

        info!(table = %self.name(), key = %key, "Failed mutation discarded");
        let kind = if reverted.is_some() { ChangeKind::Upserted } else { ChangeKind::Deleted };
        self.emit(key, kind, ChangeOrigin::Local, reverted);
        Ok(true)
    }

    // =========================================================================
    // Recovery and lifecycle
    // =========================================================================

    /// Seed an empty table from a backup snapshot. Dirty rows become pending
    /// mutations again. The cursor is left alone, so the next pull refetches
    /// and the idempotent apply reconciles.
    ///
    /// Returns the number of rows restored (0 if the table already has data).
    pub async fn restore_from_backup(&self, records: Vec<ReplicaRecord>) -> Result<usize> {
        let permit = self.guard.acquire(self.txn_timeout).await?;
        if !self.is_empty() || !self.pending.lock().is_empty() || records.is_empty() {
            return Ok(0);
        }

        let mut write = TableWrite::default();
        for record in records {
            if record.dirty {
                let mutation = PendingMutation {
                    key: record.key.clone(),
                    desired: Some(record.payload.clone()),
                    base: None,
                    base_watermark: record.watermark,
                    attempts: 0,
                    conflicts: 0,
                    generation: self.locks.next_generation(),
                    status: MutationStatus::Pending,
                };
                write.mutations.insert(record.key.clone(), Some(mutation));
            }
            write.rows.insert(record.key.clone(), Some(record));
        }
        let restored = write.rows.len();
        self.commit_write(&permit, write).await?;

        self.collaborators.diagnostics.report(DiagnosticEvent::BackupRestored {
            table: self.name().to_string(),
            records: restored,
        });
        Ok(restored)
    }

    /// Wait (bounded) for the in-flight transaction, then refuse new ones.
    ///
    /// `false` if a transaction was still running at the deadline.
    pub async fn close(&self, wait: Duration) -> bool {
        let drained = self.guard.drain(wait).await;
        if drained {
            debug!(table = %self.name(), "Table closed");
        } else {
            warn!(table = %self.name(), "Table closed with a transaction still in flight");
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    pub fn health(&self) -> TableHealth {
        let snapshot = self.snapshot();
        let (pending, failed) = {
            let pending = self.pending.lock();
            let failed = pending.values().filter(|m| m.is_failed()).count();
            (pending.len() - failed, failed)
        };
        TableHealth {
            table: self.name().to_string(),
            records: snapshot.len(),
            dirty: snapshot.values().filter(|r| r.dirty).count(),
            pending,
            failed,
            cursor: self.cursor(),
            guard_held: self.guard.is_held(),
            claimed_rows: self.locks.claimed_count(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Commit `write` durably, then install it in memory.
    ///
    /// Callers hold the guard for the whole call; on error nothing changes.
    async fn commit_write(&self, _guard: &OwnedSemaphorePermit, write: TableWrite) -> Result<()> {
        if write.is_empty() {
            return Ok(());
        }

        let mut tx = self.store.begin(self.name()).await?;
        for (key, row) in &write.rows {
            match row {
                Some(record) => tx.upsert_record(record).await?,
                None => tx.delete_record(key).await?,
            }
        }
        for (key, mutation) in &write.mutations {
            match mutation {
                Some(mutation) => tx.upsert_mutation(mutation).await?,
                None => tx.delete_mutation(key).await?,
            }
        }
        if let Some(watermark) = write.cursor {
            tx.set_cursor(watermark).await?;
        }
        tx.commit().await?;

        if !write.rows.is_empty() {
            let mut replica = self.replica.write();
            let rows = Arc::make_mut(&mut *replica);
            for (key, row) in write.rows {
                match row {
                    Some(record) => {
                        rows.insert(key, record);
                    }
                    None => {
                        rows.remove(&key);
                        self.access.remove(&key);
                    }
                }
            }
        }

        if !write.mutations.is_empty() {
            {
                let mut pending = self.pending.lock();
                for (key, mutation) in write.mutations {
                    match mutation {
                        Some(mutation) => {
                            pending.insert(key, mutation);
                        }
                        None => {
                            pending.remove(&key);
                        }
                    }
                }
            }
            self.publish_mutation_gauge();
        }

        if let Some(watermark) = write.cursor {
            let mut cursor = self.cursor.lock();
            *cursor = cursor.advanced(watermark);
            metrics::set_cursor(self.name(), cursor.watermark);
        }

        Ok(())
    }

    fn emit(&self, key: &str, kind: ChangeKind, origin: ChangeOrigin, record: Option<ReplicaRecord>) {
        // No receivers is fine.
        let _ = self.changes.send(LocalChange {
            table: self.name().to_string(),
            key: key.to_string(),
            kind,
            origin,
            record,
        });
    }

    fn publish_mutation_gauge(&self) {
        let pending = self.pending.lock();
        let failed = pending.values().filter(|m| m.is_failed()).count();
        metrics::set_pending_mutations(self.name(), pending.len() - failed, failed);
    }
}

impl std::fmt::Debug for ReplicatedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedTable")
            .field("name", &self.registration.name)
            .field("records", &self.len())
            .field("cursor", &self.cursor())
            .finish_non_exhaustive()
    }
}
