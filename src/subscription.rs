// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscription bridge: one realtime channel per table.
//!
//! # Lifecycle of a channel
//!
//! ```text
//! subscribe() ──spawn pump──► Connecting ──handshake──► Subscribed ──events──► coalesce ──► apply
//!      │                          │                          │
//!      │                          │ error / timeout          │ error mid-stream
//!      ▼                          ▼                          ▼
//! ReadinessHandle          Errored (Degraded)           Errored (table polls)
//! ```
//!
//! The readiness handle settles exactly once: `Ready` on subscribed,
//! `Degraded(reason)` on error, timeout, or unsubscribe before subscribing.
//! A degraded table is logged once and reported once; it is not retried in
//! a loop. It keeps syncing through the scheduled pull.
//!
//! # Rate limiting
//!
//! All pumps share one token bucket. A flush of N coalesced events takes N
//! tokens before it is applied, so a reconnect storm across many tables can't
//! monopolize the tables' guards.

use crate::coalesce::{CoalesceConfig, EventCoalescer};
use crate::config::SubscriptionConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink};
use crate::error::ReplicaError;
use crate::metrics;
use crate::remote::{ChannelMessage, ChannelStatus, RemoteChannel, RemoteStore, SubscriptionFilter};
use crate::resilience::RateLimiter;
use crate::table::ReplicatedTable;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// How a table's subscription settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Never reached "subscribed"; the table runs polling-only.
    Degraded(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Settles once; cloneable and awaitable any number of times.
#[derive(Debug, Clone)]
pub struct ReadinessHandle {
    table: String,
    rx: watch::Receiver<Option<Readiness>>,
}

impl ReadinessHandle {
    fn pending(table: &str) -> (watch::Sender<Option<Readiness>>, Self) {
        let (tx, rx) = watch::channel(None);
        (
            tx,
            Self {
                table: table.to_string(),
                rx,
            },
        )
    }

    /// Already settled; used for tables without a realtime channel.
    pub fn settled(table: &str, readiness: Readiness) -> Self {
        let (tx, rx) = watch::channel(Some(readiness));
        drop(tx);
        Self {
            table: table.to_string(),
            rx,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current value without waiting.
    pub fn peek(&self) -> Option<Readiness> {
        self.rx.borrow().clone()
    }

    /// Wait for the settled value. Never fails: a bridge that went away
    /// before settling counts as degraded.
    pub async fn wait(&self) -> Readiness {
        let mut rx = self.rx.clone();
        loop {
            if let Some(readiness) = rx.borrow_and_update().clone() {
                return readiness;
            }
            if rx.changed().await.is_err() {
                return self
                    .peek()
                    .unwrap_or_else(|| Readiness::Degraded("subscription dropped".to_string()));
            }
        }
    }
}

/// Public view of one table's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub table: String,
    pub channel_id: Option<String>,
    pub status: ChannelStatus,
    pub readiness: Option<Readiness>,
}

impl SubscriptionHandle {
    /// Polling-only: never subscribed, or lost the channel.
    pub fn is_degraded(&self) -> bool {
        matches!(self.readiness, Some(Readiness::Degraded(_))) || matches!(self.status, ChannelStatus::Errored(_))
    }
}

fn status_label(status: &ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Connecting => "connecting",
        ChannelStatus::Subscribed => "subscribed",
        ChannelStatus::Errored(_) => "errored",
        ChannelStatus::Closed => "closed",
    }
}

/// State shared between the bridge and one pump task.
struct ChannelShared {
    table: String,
    status: Mutex<ChannelStatus>,
    channel_id: Mutex<Option<String>>,
    ready_tx: watch::Sender<Option<Readiness>>,
}

impl ChannelShared {
    fn set_status(&self, status: ChannelStatus) {
        metrics::set_subscription_status(&self.table, status_label(&status));
        *self.status.lock() = status;
    }

    /// First call wins; later calls are ignored.
    fn settle(&self, readiness: Readiness) -> bool {
        self.ready_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(readiness);
            true
        })
    }
}

struct ChannelEntry {
    shared: Arc<ChannelShared>,
    readiness: ReadinessHandle,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns every table's realtime channel. Only the manager drives it.
pub struct SubscriptionBridge<R: RemoteStore> {
    remote: Arc<R>,
    config: SubscriptionConfig,
    limiter: Arc<RateLimiter>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    channels: DashMap<String, ChannelEntry>,
}

impl<R: RemoteStore> SubscriptionBridge<R> {
    pub fn new(remote: Arc<R>, config: SubscriptionConfig, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        let limit = config.rate_limit_config();
        info!(
            rate_per_sec = limit.refill_rate,
            burst = limit.burst_size,
            "Subscription rate limiting enabled"
        );
        Self {
            limiter: Arc::new(RateLimiter::new(limit)),
            remote,
            config,
            diagnostics,
            channels: DashMap::new(),
        }
    }

    /// Open the table's channel in the background. Returns immediately.
    ///
    /// Subscribing a table that already has a channel returns its existing
    /// readiness handle.
    pub fn subscribe(&self, table: Arc<ReplicatedTable>, filter: SubscriptionFilter) -> ReadinessHandle {
        let name = table.name().to_string();
        if let Some(entry) = self.channels.get(&name) {
            return entry.readiness.clone();
        }

        let (ready_tx, readiness) = ReadinessHandle::pending(&name);
        let shared = Arc::new(ChannelShared {
            table: name.clone(),
            status: Mutex::new(ChannelStatus::Connecting),
            channel_id: Mutex::new(None),
            ready_tx,
        });
        shared.set_status(ChannelStatus::Connecting);

        let (stop, stop_rx) = watch::channel(false);
        let pump = Pump {
            remote: Arc::clone(&self.remote),
            table,
            filter,
            handshake_timeout: self.config.handshake_timeout(),
            coalesce: CoalesceConfig::from_subscription(&self.config),
            limiter: Arc::clone(&self.limiter),
            diagnostics: Arc::clone(&self.diagnostics),
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(pump.run(stop_rx));

        debug!(table = %name, "Subscription requested");
        self.channels.insert(
            name,
            ChannelEntry {
                shared,
                readiness: readiness.clone(),
                stop,
                task,
            },
        );
        readiness
    }

    /// Close the table's channel. Idempotent; safe before "subscribed".
    ///
    /// Returns `false` if the table had no channel.
    pub async fn unsubscribe(&self, table: &str, wait: Duration) -> bool {
        let Some((_, entry)) = self.channels.remove(table) else {
            return false;
        };

        let _ = entry.stop.send(true);
        entry.shared.settle(Readiness::Degraded("unsubscribed before ready".to_string()));

        match tokio::time::timeout(wait, entry.task).await {
            Ok(Ok(())) => debug!(table = %table, "Subscription pump stopped"),
            Ok(Err(e)) => warn!(table = %table, error = %e, "Subscription pump panicked"),
            Err(_) => warn!(table = %table, "Subscription pump did not stop in time"),
        }
        entry.shared.set_status(ChannelStatus::Closed);
        true
    }

    /// Close every channel, in parallel.
    pub async fn unsubscribe_all(&self, wait: Duration) {
        let tables: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        futures::future::join_all(tables.iter().map(|t| self.unsubscribe(t, wait))).await;
    }

    pub fn status(&self, table: &str) -> Option<ChannelStatus> {
        self.channels.get(table).map(|e| e.shared.status.lock().clone())
    }

    pub fn readiness(&self, table: &str) -> Option<ReadinessHandle> {
        self.channels.get(table).map(|e| e.readiness.clone())
    }

    pub fn handle(&self, table: &str) -> Option<SubscriptionHandle> {
        self.channels.get(table).map(|e| SubscriptionHandle {
            table: table.to_string(),
            channel_id: e.shared.channel_id.lock().clone(),
            status: e.shared.status.lock().clone(),
            readiness: e.readiness.peek(),
        })
    }

    pub fn is_subscribed(&self, table: &str) -> bool {
        self.channels.contains_key(table)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// One table's pump: handshake, then coalesce and apply until stopped.
struct Pump<R: RemoteStore> {
    remote: Arc<R>,
    table: Arc<ReplicatedTable>,
    filter: SubscriptionFilter,
    handshake_timeout: Duration,
    coalesce: CoalesceConfig,
    limiter: Arc<RateLimiter>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    shared: Arc<ChannelShared>,
}

impl<R: RemoteStore> Pump<R> {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let span = info_span!("subscription", table = %self.table.name());

        async move {
            let Some(mut channel) = self.handshake(&mut stop).await else {
                return;
            };

            *self.shared.channel_id.lock() = Some(channel.id().to_string());
            self.shared.set_status(ChannelStatus::Subscribed);
            self.shared.settle(Readiness::Ready);
            info!(channel = %channel.id(), "Subscribed");

            let mut coalescer = EventCoalescer::new(self.table.name(), self.coalesce.clone());

            loop {
                let deadline = coalescer
                    .deadline()
                    .map(tokio::time::Instant::from_std)
                    .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

                tokio::select! {
                    biased;

                    _ = stop.changed() => {
                        debug!("Unsubscribe requested");
                        break;
                    }

                    _ = tokio::time::sleep_until(deadline), if !coalescer.is_empty() => {
                        self.flush(&mut coalescer).await;
                    }

                    message = channel.next() => match message {
                        ChannelMessage::Event(event) => {
                            coalescer.add(event);
                            if coalescer.should_flush() {
                                self.flush(&mut coalescer).await;
                            }
                        }
                        ChannelMessage::Status(ChannelStatus::Errored(reason)) => {
                            self.degrade(format!("channel errored: {}", reason));
                            break;
                        }
                        ChannelMessage::Status(ChannelStatus::Closed) | ChannelMessage::Ended => {
                            info!("Channel closed by remote; table continues polling-only");
                            self.shared.set_status(ChannelStatus::Closed);
                            break;
                        }
                        ChannelMessage::Status(_) => {}
                    },
                }
            }

            if !coalescer.is_empty() {
                self.flush(&mut coalescer).await;
            }
            channel.close();
        }
        .instrument(span)
        .await
    }

    /// Open the channel and wait for "subscribed". `None` means the table is
    /// degraded (or unsubscribed) and the pump should exit.
    async fn handshake(&self, stop: &mut watch::Receiver<bool>) -> Option<RemoteChannel> {
        let scope = self.table.scope();
        let open = async {
            let mut channel = self
                .remote
                .subscribe(&scope, &self.filter)
                .await
                .map_err(|e| e.to_string())?;
            channel.wait_subscribed().await.map(|()| channel)
        };

        tokio::select! {
            biased;

            _ = stop.changed() => {
                self.shared.settle(Readiness::Degraded("unsubscribed before ready".to_string()));
                self.shared.set_status(ChannelStatus::Closed);
                None
            }

            result = tokio::time::timeout(self.handshake_timeout, open) => match result {
                Ok(Ok(channel)) => Some(channel),
                Ok(Err(reason)) => {
                    self.degrade(reason);
                    None
                }
                Err(_) => {
                    self.degrade(format!(
                        "handshake timed out after {}",
                        humantime::format_duration(self.handshake_timeout)
                    ));
                    None
                }
            },
        }
    }

    /// Mark the table polling-only. Logged and reported once per channel.
    fn degrade(&self, reason: String) {
        self.shared.set_status(ChannelStatus::Errored(reason.clone()));
        self.shared.settle(Readiness::Degraded(reason.clone()));
        warn!(reason = %reason, "Subscription degraded; table will sync by polling only");
        self.diagnostics.report(DiagnosticEvent::SubscriptionDegraded {
            table: self.table.name().to_string(),
            reason,
        });
    }

    async fn flush(&self, coalescer: &mut EventCoalescer) {
        let events = coalescer.take();
        if events.is_empty() {
            return;
        }
        self.limiter.acquire_many(events.len()).await;

        let count = events.len();
        match self.table.apply_remote_events(events).await {
            Ok(result) => debug!(
                events = count,
                applied = result.applied,
                rebased = result.rebased,
                skipped = result.skipped,
                "Realtime events applied"
            ),
            Err(ReplicaError::Shutdown) => {
                debug!(events = count, "Table closed; dropping realtime events");
            }
            Err(e) => {
                // Events are not replayed; the next pull picks the rows up.
                warn!(error = %e, events = count, "Failed to apply realtime events");
                metrics::record_table_error(self.table.name(), e.kind());
                self.diagnostics.report(DiagnosticEvent::TableError {
                    table: self.table.name().to_string(),
                    operation: "apply_events",
                    kind: e.kind(),
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }
}
