// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background tasks started by `start_auto_sync()`.
//!
//! Every task shares the manager's [`ManagerContext`] and stops when the
//! shutdown watch flips to `true`. Shutdown is checked first (`biased`) so a
//! tick that lands together with shutdown never starts another round.
//!
//! | Task       | Trigger                         | Work                         |
//! |------------|---------------------------------|------------------------------|
//! | periodic   | `sync.auto_sync_interval`       | `sync_all`                   |
//! | reconnect  | `notify_reconnect()`            | `sync_all`                   |
//! | eviction   | `eviction.interval`             | `evict_stale` on every table |
//! | backup     | `backup.interval`               | debounced snapshot per table |

use super::{ManagerContext, TableSyncStatus};
use crate::remote::RemoteStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, Instrument};

/// Resolves when shutdown is signalled (or the sender is gone).
async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

fn log_round(trigger: &'static str, results: &[(String, TableSyncStatus)], started: Instant) {
    let synced = results.iter().filter(|(_, s)| s.is_synced()).count();
    let failed = results.iter().filter(|(_, s)| s.is_failed()).count();
    let coalesced = results.len() - synced - failed;

    if failed > 0 {
        info!(
            trigger,
            synced,
            failed,
            coalesced,
            duration_ms = started.elapsed().as_millis() as u64,
            "Sync round finished with failures"
        );
    } else {
        debug!(
            trigger,
            synced,
            coalesced,
            duration_ms = started.elapsed().as_millis() as u64,
            "Sync round finished"
        );
    }
}

/// Sync every table each `period`. The first round runs immediately.
pub(super) fn spawn_periodic_sync<R: RemoteStore>(ctx: Arc<ManagerContext<R>>, period: Duration) -> JoinHandle<()> {
    let mut shutdown_rx = ctx.shutdown_receiver();
    let span = tracing::info_span!("periodic_sync");

    tokio::spawn(
        async move {
            info!(interval_ms = period.as_millis() as u64, "Starting periodic sync task");

            let mut timer = tokio::time::interval(period);
            // A slow round delays the next one instead of bursting to catch up
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => break,
                    _ = timer.tick() => {}
                }

                let started = Instant::now();
                let results = ctx.sync_all().await;
                log_round("periodic", &results, started);
            }

            info!("Periodic sync task stopped");
        }
        .instrument(span),
    )
}

/// Sync every table whenever the host reports regained connectivity.
pub(super) fn spawn_reconnect_sync<R: RemoteStore>(ctx: Arc<ManagerContext<R>>) -> JoinHandle<()> {
    let mut shutdown_rx = ctx.shutdown_receiver();
    let span = tracing::info_span!("reconnect_sync");

    tokio::spawn(
        async move {
            debug!("Starting reconnect sync task");

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => break,
                    _ = ctx.reconnect.notified() => {}
                }

                info!("Connectivity regained, syncing all tables");
                let started = Instant::now();
                let results = ctx.sync_all().await;
                log_round("reconnect", &results, started);
            }

            debug!("Reconnect sync task stopped");
        }
        .instrument(span),
    )
}

/// Evict stale rows each `period`, first pass one period after start.
pub(super) fn spawn_eviction<R: RemoteStore>(ctx: Arc<ManagerContext<R>>, period: Duration) -> JoinHandle<()> {
    let mut shutdown_rx = ctx.shutdown_receiver();
    let span = tracing::info_span!("eviction");

    tokio::spawn(
        async move {
            info!(interval_secs = period.as_secs(), "Starting eviction task");

            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => break,
                    _ = timer.tick() => {}
                }

                let evicted = ctx.evict_all(Utc::now()).await;
                if evicted > 0 {
                    info!(evicted, "Eviction pass removed rows");
                } else {
                    debug!("Eviction pass found nothing to remove");
                }
            }

            info!("Eviction task stopped");
        }
        .instrument(span),
    )
}

/// Snapshot opted-in tables to the fallback store each `period`.
pub(super) fn spawn_backup<R: RemoteStore>(ctx: Arc<ManagerContext<R>>, period: Duration) -> JoinHandle<()> {
    let mut shutdown_rx = ctx.shutdown_receiver();
    let span = tracing::info_span!("backup");

    tokio::spawn(
        async move {
            info!(interval_secs = period.as_secs(), "Starting backup task");

            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown_rx) => break,
                    _ = timer.tick() => {}
                }

                ctx.backup_all().await;
            }

            info!("Backup task stopped");
        }
        .instrument(span),
    )
}
