// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull/push protocol between a [`ReplicatedTable`] and the remote store.
//!
//! # Sync of one table
//!
//! ```text
//! push_pending_mutations ──► pull_table
//!   │                          │
//!   │ per row (oldest first):  │ fetch_since(cursor)        [reads circuit, timeout]
//!   │   claim row lock         │ apply_remote_batch(rows, max watermark)
//!   │   push(base_watermark)   │   └─ rows + cursor in one transaction
//!   │     Ack      → confirm   │
//!   │     Conflict → rebase, push again (conflict budget)
//!   │     Transient→ backoff, push again (attempt budget),
//!   │                then defer: row stays pending, pass ends
//!   │     Rejected → fail
//! ```
//!
//! Local writes go out before the pull, so a pull never has to rebase a row
//! the push was about to confirm anyway.
//!
//! # Superseded pushes
//!
//! Every push carries the mutation's [`LockToken`](crate::mutation::LockToken).
//! When a newer local write (or a remote rebase) replaced the mutation while
//! the push was in flight, the table refuses to resolve the stale token and
//! the loop pushes the current intent instead.
//!
//! # Failures
//!
//! Transient remote failures and timeouts pass through the circuit and are
//! retried with backoff up to the attempt budget. A row that spends the
//! budget is deferred, not failed: it stays pending and the rest of the pass
//! is skipped, so an outage costs one row's backoff and every offline write
//! goes out on the next sync. Only a rejection or a spent conflict budget
//! marks a mutation failed. Storage errors abort this table's sync and
//! propagate to the caller.

use crate::backup::{BackupOutcome, BackupStore};
use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, RemoteCircuit};
use crate::config::ReplicationSettings;
use crate::diagnostics::DiagnosticsSink;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::record::{ReplicaRecord, Watermark};
use crate::remote::{PushOutcome, RemoteError, RemotePush, RemoteResult, RemoteStore};
use crate::resilience::RetryConfig;
use crate::table::{ApplyResult, ReplicatedTable};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How one row's push ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushResult {
    /// The remote accepted the row at this watermark; the row is clean.
    Confirmed { watermark: Watermark },
    /// Nothing left to push: the mutation went away (both sides deleted it,
    /// or it was discarded) before it was confirmed.
    Resolved,
    /// Another push holds the row lock; this one stepped aside.
    Busy,
    /// Gave up; the mutation is marked failed and needs attention.
    Failed { reason: String },
    /// The remote stayed unreachable; the mutation is still pending.
    Deferred { reason: String },
}

/// Tally of one `push_pending_mutations` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub confirmed: usize,
    pub resolved: usize,
    pub busy: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl PushReport {
    fn record(&mut self, result: &PushResult) {
        match result {
            PushResult::Confirmed { .. } => self.confirmed += 1,
            PushResult::Resolved => self.resolved += 1,
            PushResult::Busy => self.busy += 1,
            PushResult::Failed { .. } => self.failed += 1,
            PushResult::Deferred { .. } => self.deferred += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.confirmed + self.resolved + self.busy + self.failed + self.deferred
    }
}

/// Result of a full push-then-pull sync of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSyncReport {
    pub table: String,
    pub pushed: PushReport,
    /// Rows returned by `fetch_since`.
    pub fetched: usize,
    pub applied: ApplyResult,
    pub duration: Duration,
}

/// Remote call failure that counts against the circuit.
#[derive(Debug)]
enum CallError {
    Transient(String),
    TimedOut,
}

/// Drives the delta protocol for any number of tables.
///
/// Holds no per-table state; tables carry their own cursor, mutations and
/// guard, so different tables sync in parallel.
pub struct SyncEngine<R: RemoteStore> {
    remote: Arc<R>,
    circuit: RemoteCircuit,
    retry: RetryConfig,
    push_timeout: Duration,
    fetch_timeout: Duration,
    conflict_budget: u32,
    backups: Option<Arc<BackupStore>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(
        remote: Arc<R>,
        settings: &ReplicationSettings,
        backups: Option<Arc<BackupStore>>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            remote,
            circuit: RemoteCircuit::new(CircuitConfig::from_push(&settings.push)),
            retry: settings.push.retry_config(),
            push_timeout: settings.push.push_timeout(),
            fetch_timeout: settings.sync.fetch_timeout(),
            conflict_budget: settings.push.conflict_budget,
            backups,
            diagnostics,
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn circuit(&self) -> &RemoteCircuit {
        &self.circuit
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticsSink> {
        &self.diagnostics
    }

    /// Push local intent, then pull everything past the cursor.
    #[instrument(skip_all, fields(table = %table.name()))]
    pub async fn sync_table(&self, table: &ReplicatedTable) -> Result<TableSyncReport> {
        let start = Instant::now();

        let pushed = self.push_pending_mutations(table).await?;
        let (fetched, applied) = self.pull_table(table).await?;

        let duration = start.elapsed();
        metrics::record_sync(table.name(), fetched, applied.applied, applied.skipped, duration);
        debug!(
            fetched,
            applied = applied.applied,
            skipped = applied.skipped,
            rebased = applied.rebased,
            pushed = pushed.confirmed,
            cursor = applied.cursor,
            elapsed_ms = duration.as_millis() as u64,
            "Table synced"
        );

        Ok(TableSyncReport {
            table: table.name().to_string(),
            pushed,
            fetched,
            applied,
            duration,
        })
    }

    /// Fetch rows past the cursor and apply them as one batch.
    ///
    /// The cursor moves to the batch's highest watermark in the same
    /// transaction; on any error it stays where it was.
    pub async fn pull_table(&self, table: &ReplicatedTable) -> Result<(usize, ApplyResult)> {
        let scope = table.scope();
        let cursor = table.cursor();

        let records = self
            .guarded(&self.circuit.reads, table.name(), "fetch_since", self.fetch_timeout, || {
                self.remote.fetch_since(&scope, cursor)
            })
            .await?;

        let fetched = records.len();
        let target = records.iter().map(|r| r.watermark).max().unwrap_or(cursor);
        let applied = table.apply_remote_batch(records, target).await?;
        Ok((fetched, applied))
    }

    /// Push every pending (not failed) mutation, oldest write first.
    pub async fn push_pending_mutations(&self, table: &ReplicatedTable) -> Result<PushReport> {
        let mut report = PushReport::default();
        let pending = table.pending_mutations();
        let queued = pending.len();
        for mutation in pending {
            let result = self.push_row(table, &mutation.key).await?;
            report.record(&result);
            if matches!(result, PushResult::Deferred { .. }) {
                debug!(
                    table = %table.name(),
                    left = queued - report.total(),
                    "Remote unreachable; remaining mutations wait for the next sync"
                );
                break;
            }
        }
        if report.total() > 0 {
            debug!(
                table = %table.name(),
                confirmed = report.confirmed,
                failed = report.failed,
                deferred = report.deferred,
                busy = report.busy,
                "Pending mutations pushed"
            );
        }
        Ok(report)
    }

    /// Push one row's mutation until it is confirmed, resolved, failed or
    /// deferred.
    ///
    /// Holds the row lock for the whole exchange. Backoff sleeps happen with
    /// the lock held but never with the table's guard held.
    pub async fn push_row(&self, table: &ReplicatedTable, key: &str) -> Result<PushResult> {
        let _claim = match table.claim_row(key) {
            Ok(claim) => claim,
            Err(ReplicaError::LockBusy { .. }) => {
                metrics::record_push(table.name(), "lock_busy");
                return Ok(PushResult::Busy);
            }
            Err(e) => return Err(e),
        };
        let scope = table.scope();
        let mut transient = 0;

        loop {
            let Some(mutation) = table.mutation_for(key) else {
                return Ok(PushResult::Resolved);
            };
            if let Some(reason) = mutation.failure_reason() {
                return Ok(PushResult::Failed {
                    reason: reason.to_string(),
                });
            }
            let token = mutation.token();

            let push = RemotePush {
                key: key.to_string(),
                payload: mutation.desired.clone(),
                base_watermark: mutation.base_watermark,
            };
            let outcome = self
                .guarded(&self.circuit.writes, table.name(), "push", self.push_timeout, || {
                    self.remote.push(&scope, push)
                })
                .await;

            match outcome {
                Ok(PushOutcome::Ack { watermark }) => {
                    if table.confirm_mutation(&token, watermark).await? {
                        metrics::record_push(table.name(), "confirmed");
                        debug!(table = %table.name(), key = %key, watermark, "Push confirmed");
                        return Ok(PushResult::Confirmed { watermark });
                    }
                    // A newer write replaced the intent mid-flight.
                    metrics::record_push(table.name(), "superseded");
                }

                Ok(PushOutcome::Conflict { current }) => {
                    metrics::record_push(table.name(), "conflict");
                    if mutation.conflicts >= self.conflict_budget {
                        let reason = format!("conflicted {} times", mutation.conflicts + 1);
                        if let Some(result) = self.give_up(table, &token, reason).await? {
                            return Ok(result);
                        }
                        continue;
                    }

                    let current = match current {
                        Some(row) => Some(row),
                        None => {
                            match self
                                .guarded(&self.circuit.reads, table.name(), "fetch_row", self.fetch_timeout, || {
                                    self.remote.fetch_row(&scope, key)
                                })
                                .await
                            {
                                Ok(row) => row,
                                Err(e) if e.is_retryable() => {
                                    transient += 1;
                                    if let Some(result) = self.back_off(table, &token, &e, transient).await? {
                                        return Ok(result);
                                    }
                                    continue;
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    };
                    debug!(
                        table = %table.name(),
                        key = %key,
                        conflicts = mutation.conflicts + 1,
                        "Push conflicted, rebasing"
                    );
                    table.rebase_mutation(&token, current).await?;
                }

                Err(ReplicaError::RemoteRejected { message, .. }) => {
                    let reason = format!("rejected by remote: {}", message);
                    if let Some(result) = self.give_up(table, &token, reason).await? {
                        return Ok(result);
                    }
                }

                Err(e) if e.is_retryable() => {
                    transient += 1;
                    if let Some(result) = self.back_off(table, &token, &e, transient).await? {
                        return Ok(result);
                    }
                }

                Err(e) => return Err(e),
            }
        }
    }

    /// Count a transient failure and sleep. Once `tries` failures in this
    /// push spend the attempt budget the row is deferred and stays pending.
    /// `None` means "push again".
    async fn back_off(
        &self,
        table: &ReplicatedTable,
        token: &crate::mutation::LockToken,
        error: &ReplicaError,
        tries: u32,
    ) -> Result<Option<PushResult>> {
        let Some(mutation) = table.record_attempt(token).await? else {
            metrics::record_push(table.name(), "superseded");
            return Ok(None);
        };

        if self.retry.is_exhausted(tries) {
            metrics::record_push(table.name(), "deferred");
            info!(
                table = %table.name(),
                key = %token.key,
                attempts = mutation.attempts,
                error = %error,
                "Remote unreachable, push deferred to the next sync"
            );
            return Ok(Some(PushResult::Deferred {
                reason: error.to_string(),
            }));
        }

        metrics::record_push(table.name(), "retry");
        let delay = self.retry.backoff(tries - 1);
        metrics::record_push_backoff(table.name(), delay);
        debug!(
            table = %table.name(),
            key = %token.key,
            attempt = tries,
            total_attempts = mutation.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Push failed, backing off"
        );
        tokio::time::sleep(delay).await;
        Ok(None)
    }

    /// Mark the mutation failed. `None` if a newer write superseded it, in
    /// which case the caller pushes that instead.
    async fn give_up(
        &self,
        table: &ReplicatedTable,
        token: &crate::mutation::LockToken,
        reason: String,
    ) -> Result<Option<PushResult>> {
        if table.fail_mutation(token, &reason).await? {
            metrics::record_push(table.name(), "failed");
            return Ok(Some(PushResult::Failed { reason }));
        }
        metrics::record_push(table.name(), "superseded");
        Ok(None)
    }

    /// Debounced backup of the table's current rows.
    ///
    /// `None` when backups are off or the table doesn't opt in.
    pub async fn backup_snapshot(&self, table: &Arc<ReplicatedTable>) -> Result<Option<BackupOutcome>> {
        let Some(backups) = self.backup_target(table) else {
            return Ok(None);
        };
        let source = Arc::clone(table);
        let outcome = backups
            .request(table.name(), move || source.snapshot().values().cloned().collect())
            .await?;
        Ok(Some(outcome))
    }

    /// Immediate backup, bypassing the debounce. Used at shutdown.
    pub async fn flush_backup(&self, table: &ReplicatedTable) -> Result<Option<BackupOutcome>> {
        let Some(backups) = self.backup_target(table) else {
            return Ok(None);
        };
        let records: Vec<ReplicaRecord> = table.snapshot().values().cloned().collect();
        let outcome = backups.flush(table.name(), &records).await?;
        if let BackupOutcome::Written { records, .. } = &outcome {
            info!(table = %table.name(), records, "Backup flushed");
        }
        Ok(Some(outcome))
    }

    fn backup_target(&self, table: &ReplicatedTable) -> Option<&Arc<BackupStore>> {
        self.backups.as_ref().filter(|_| table.registration().backup)
    }

    /// Run a remote call through `breaker` with a time bound.
    ///
    /// Transient errors and timeouts count as circuit failures. A rejection
    /// is an answer from a reachable remote and passes through as a
    /// successful call. An open circuit maps to `TransientNetwork` so callers
    /// retry it like any other outage.
    async fn guarded<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        table: &str,
        operation: &'static str,
        limit: Duration,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let outcome = breaker
            .call(|| async move {
                match tokio::time::timeout(limit, call()).await {
                    Ok(Ok(value)) => Ok(Ok(value)),
                    Ok(Err(RemoteError::Rejected(message))) => Ok(Err(message)),
                    Ok(Err(RemoteError::Transient(message))) => Err(CallError::Transient(message)),
                    Err(_) => Err(CallError::TimedOut),
                }
            })
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ReplicaError::RemoteRejected {
                table: table.to_string(),
                message,
            }),
            Err(CircuitError::Rejected) => Err(ReplicaError::TransientNetwork {
                table: table.to_string(),
                message: format!("{} skipped: circuit open", operation),
            }),
            Err(CircuitError::Inner(CallError::TimedOut)) => {
                warn!(table = %table, operation, "Remote call timed out");
                Err(ReplicaError::timeout(format!("{} {}", operation, table), limit))
            }
            Err(CircuitError::Inner(CallError::Transient(message))) => Err(ReplicaError::TransientNetwork {
                table: table.to_string(),
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::diagnostics::{Collaborators, TracingDiagnostics};
    use crate::record::{Payload, TableRegistration};
    use crate::remote::{BoxFuture, RemoteChannel, RemoteRecord, RemoteScope, SubscriptionFilter};
    use crate::store::LocalStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use tempfile::{tempdir, TempDir};

    /// Remote that answers pushes from a script, then acks.
    #[derive(Default)]
    struct ScriptedRemote {
        rows: Mutex<Vec<RemoteRecord>>,
        push_script: Mutex<VecDeque<RemoteResult<PushOutcome>>>,
        pushes: Mutex<Vec<RemotePush>>,
        fetch_row_result: Mutex<Option<RemoteRecord>>,
    }

    impl ScriptedRemote {
        fn script(&self, outcomes: Vec<RemoteResult<PushOutcome>>) {
            self.push_script.lock().extend(outcomes);
        }
    }

    impl RemoteStore for ScriptedRemote {
        fn fetch_since(&self, _scope: &RemoteScope, watermark: Watermark) -> BoxFuture<'_, Vec<RemoteRecord>> {
            let rows: Vec<_> = self
                .rows
                .lock()
                .iter()
                .filter(|r| r.watermark > watermark)
                .cloned()
                .collect();
            Box::pin(async move { Ok(rows) })
        }

        fn fetch_row(&self, _scope: &RemoteScope, _key: &str) -> BoxFuture<'_, Option<RemoteRecord>> {
            let row = self.fetch_row_result.lock().clone();
            Box::pin(async move { Ok(row) })
        }

        fn push(&self, _scope: &RemoteScope, push: RemotePush) -> BoxFuture<'_, PushOutcome> {
            let scripted = self.push_script.lock().pop_front();
            let ack = push.base_watermark + 100;
            self.pushes.lock().push(push);
            Box::pin(async move { scripted.unwrap_or(Ok(PushOutcome::Ack { watermark: ack })) })
        }

        fn subscribe(&self, _scope: &RemoteScope, _filter: &SubscriptionFilter) -> BoxFuture<'_, RemoteChannel> {
            Box::pin(async { Ok(RemoteChannel::pair("unused", 1).0) })
        }
    }

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    fn settings(dir: &TempDir) -> ReplicationSettings {
        let mut settings = ReplicationSettings::for_testing(dir.path());
        settings.push.base_delay = "5ms".into();
        settings.push.max_delay = "20ms".into();
        settings.push.jitter = "0ms".into();
        settings
    }

    async fn setup(remote: ScriptedRemote) -> (TempDir, Arc<ScriptedRemote>, SyncEngine<ScriptedRemote>, ReplicatedTable) {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(&StoreConfig::for_testing(dir.path())).await.unwrap());
        let table = ReplicatedTable::open(
            TableRegistration::new("entries"),
            "t1",
            store,
            Duration::from_secs(1),
            Collaborators::default(),
        )
        .await
        .unwrap();
        let remote = Arc::new(remote);
        let engine = SyncEngine::new(Arc::clone(&remote), &settings(&dir), None, Arc::new(TracingDiagnostics));
        (dir, remote, engine, table)
    }

    #[tokio::test]
    async fn test_pull_applies_and_advances_cursor() {
        let remote = ScriptedRemote::default();
        remote.rows.lock().extend([
            RemoteRecord::new("1", payload(json!({"id": "1"})), 3),
            RemoteRecord::new("2", payload(json!({"id": "2"})), 7),
        ]);
        let (_dir, _remote, engine, table) = setup(remote).await;

        let (fetched, applied) = engine.pull_table(&table).await.unwrap();
        assert_eq!(fetched, 2);
        assert_eq!(applied.applied, 2);
        assert_eq!(table.cursor(), 7);

        let (fetched, _) = engine.pull_table(&table).await.unwrap();
        assert_eq!(fetched, 0);
        assert_eq!(table.cursor(), 7);
    }

    #[tokio::test]
    async fn test_push_ack_confirms_row() {
        let (_dir, remote, engine, table) = setup(ScriptedRemote::default()).await;
        table.put("1", payload(json!({"v": 1}))).await.unwrap();

        let result = engine.push_row(&table, "1").await.unwrap();
        assert_eq!(result, PushResult::Confirmed { watermark: 100 });
        assert!(!table.get("1").unwrap().dirty);
        assert_eq!(remote.pushes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_confirm() {
        let remote = ScriptedRemote::default();
        remote.script(vec![
            Err(RemoteError::Transient("offline".into())),
            Err(RemoteError::Transient("offline".into())),
        ]);
        let (_dir, remote, engine, table) = setup(remote).await;
        table.put("1", payload(json!({"v": 1}))).await.unwrap();

        let result = engine.push_row(&table, "1").await.unwrap();
        assert!(matches!(result, PushResult::Confirmed { .. }));
        assert_eq!(remote.pushes.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausted_defers_row() {
        let remote = ScriptedRemote::default();
        remote.script((0..10).map(|_| Err(RemoteError::Transient("offline".into()))).collect());
        let (_dir, remote, engine, table) = setup(remote).await;
        table.put("1", payload(json!({"v": 1}))).await.unwrap();

        let result = engine.push_row(&table, "1").await.unwrap();
        assert!(matches!(result, PushResult::Deferred { .. }));
        // for_testing allows 4 attempts.
        assert_eq!(remote.pushes.lock().len(), 4);
        assert!(table.failed_mutations().is_empty());
        let mutation = table.mutation_for("1").unwrap();
        assert!(!mutation.is_failed());
        assert_eq!(mutation.attempts, 4);
        assert!(table.get("1").unwrap().dirty);

        // The next pass picks it up again.
        remote.push_script.lock().clear();
        let result = engine.push_row(&table, "1").await.unwrap();
        assert!(matches!(result, PushResult::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_outage_ends_push_pass_after_one_row() {
        let remote = ScriptedRemote::default();
        remote.script((0..20).map(|_| Err(RemoteError::Transient("offline".into()))).collect());
        let (_dir, remote, engine, table) = setup(remote).await;
        for key in ["1", "2", "3"] {
            table.put(key, payload(json!({"v": 1}))).await.unwrap();
        }

        let report = engine.push_pending_mutations(&table).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.total(), 1);
        assert_eq!(remote.pushes.lock().len(), 4);
        assert_eq!(table.pending_mutations().len(), 3);
        assert!(table.failed_mutations().is_empty());

        remote.push_script.lock().clear();
        let report = engine.push_pending_mutations(&table).await.unwrap();
        assert_eq!(report.confirmed, 3);
        assert!(table.pending_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_push_fails_immediately() {
        let remote = ScriptedRemote::default();
        remote.script(vec![Err(RemoteError::Rejected("schema".into()))]);
        let (_dir, _remote, engine, table) = setup(remote).await;
        table.put("1", payload(json!({"v": 1}))).await.unwrap();

        match engine.push_row(&table, "1").await.unwrap() {
            PushResult::Failed { reason } => assert!(reason.contains("schema")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejections_do_not_trip_write_circuit() {
        let remote = ScriptedRemote::default();
        remote.script((0..6).map(|_| Err(RemoteError::Rejected("schema".into()))).collect());
        let (dir, remote, _engine, table) = setup(remote).await;
        let mut settings = settings(&dir);
        settings.push.circuit_failure_rate = 0.5;
        settings.push.circuit_window = 2;
        let engine = SyncEngine::new(Arc::clone(&remote), &settings, None, Arc::new(TracingDiagnostics));

        for key in ["1", "2", "3", "4", "5", "6"] {
            table.put(key, payload(json!({"v": 1}))).await.unwrap();
            let result = engine.push_row(&table, key).await.unwrap();
            assert!(matches!(result, PushResult::Failed { .. }));
        }
        let metrics = engine.circuit().metrics();
        assert_eq!(metrics.writes_failures, 0);
        assert_eq!(metrics.writes_rejections, 0);

        table.put("7", payload(json!({"v": 1}))).await.unwrap();
        let result = engine.push_row(&table, "7").await.unwrap();
        assert!(matches!(result, PushResult::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_conflict_rebases_onto_current_row() {
        let remote = ScriptedRemote::default();
        remote.script(vec![Ok(PushOutcome::Conflict {
            current: Some(RemoteRecord::new("1", payload(json!({"id": "1", "v": 1, "note": "server"})), 9)),
        })]);
        let (_dir, remote, engine, table) = setup(remote).await;
        table
            .apply_remote_batch(vec![RemoteRecord::new("1", payload(json!({"id": "1", "v": 1})), 2)], 2)
            .await
            .unwrap();
        table.put("1", payload(json!({"id": "1", "v": 5}))).await.unwrap();

        let result = engine.push_row(&table, "1").await.unwrap();
        assert_eq!(result, PushResult::Confirmed { watermark: 109 });

        let pushes = remote.pushes.lock();
        assert_eq!(pushes[1].base_watermark, 9);
        let second = pushes[1].payload.as_ref().unwrap();
        assert_eq!(second["v"], json!(5));
        assert_eq!(second["note"], json!("server"));
    }

    #[tokio::test]
    async fn test_conflict_without_row_refetches() {
        let remote = ScriptedRemote::default();
        remote.script(vec![Ok(PushOutcome::Conflict { current: None })]);
        *remote.fetch_row_result.lock() = Some(RemoteRecord::new("1", payload(json!({"id": "1", "v": 0})), 4));
        let (_dir, remote, engine, table) = setup(remote).await;
        table.put("1", payload(json!({"id": "1", "v": 5}))).await.unwrap();

        engine.push_row(&table, "1").await.unwrap();
        assert_eq!(remote.pushes.lock()[1].base_watermark, 4);
    }

    #[tokio::test]
    async fn test_conflict_budget_exhausted() {
        let remote = ScriptedRemote::default();
        let conflict = || {
            Ok(PushOutcome::Conflict {
                current: Some(RemoteRecord::new("1", payload(json!({"id": "1"})), 1)),
            })
        };
        remote.script((0..10).map(|_| conflict()).collect());
        let (_dir, remote, engine, table) = setup(remote).await;
        table.put("1", payload(json!({"id": "1", "v": 5}))).await.unwrap();

        let result = engine.push_row(&table, "1").await.unwrap();
        assert!(matches!(result, PushResult::Failed { .. }));
        // Three rebases allowed, the fourth conflict fails.
        assert_eq!(remote.pushes.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_busy_row_steps_aside() {
        let (_dir, _remote, engine, table) = setup(ScriptedRemote::default()).await;
        table.put("1", payload(json!({"v": 1}))).await.unwrap();
        let _held = table.claim_row("1").unwrap();
        assert_eq!(engine.push_row(&table, "1").await.unwrap(), PushResult::Busy);
    }

    #[tokio::test]
    async fn test_sync_table_pushes_then_pulls() {
        let remote = ScriptedRemote::default();
        remote
            .rows
            .lock()
            .push(RemoteRecord::new("9", payload(json!({"id": "9"})), 50));
        let (_dir, _remote, engine, table) = setup(remote).await;
        table.put("1", payload(json!({"v": 1}))).await.unwrap();

        let report = engine.sync_table(&table).await.unwrap();
        assert_eq!(report.pushed.confirmed, 1);
        assert_eq!(report.fetched, 1);
        assert_eq!(table.cursor(), 50);
        assert!(table.pending_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_backup_skipped_without_store() {
        let (_dir, _remote, engine, table) = setup(ScriptedRemote::default()).await;
        let table = Arc::new(table);
        assert!(engine.backup_snapshot(&table).await.unwrap().is_none());
        assert!(engine.flush_backup(&table).await.unwrap().is_none());
    }
}
