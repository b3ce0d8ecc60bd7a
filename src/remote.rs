// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote store contract.
//!
//! The engine talks to exactly one authoritative remote store through
//! [`RemoteStore`]. The host provides the implementation (REST + websocket
//! client, test double, ...). Every call is scoped by [`RemoteScope`], which
//! carries the tenant; the engine never issues an unscoped call.
//!
//! # Example
//!
//! ```rust,no_run
//! use replica_engine::remote::{
//!     BoxFuture, PushOutcome, RemoteChannel, RemotePush, RemoteRecord, RemoteScope,
//!     RemoteStore, SubscriptionFilter,
//! };
//! use replica_engine::record::Watermark;
//!
//! struct MyBackend;
//!
//! impl RemoteStore for MyBackend {
//!     fn fetch_since(&self, _scope: &RemoteScope, _watermark: Watermark) -> BoxFuture<'_, Vec<RemoteRecord>> {
//!         Box::pin(async move { Ok(Vec::new()) })
//!     }
//!
//!     fn fetch_row(&self, _scope: &RemoteScope, _key: &str) -> BoxFuture<'_, Option<RemoteRecord>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn push(&self, _scope: &RemoteScope, push: RemotePush) -> BoxFuture<'_, PushOutcome> {
//!         Box::pin(async move { Ok(PushOutcome::Ack { watermark: push.base_watermark + 1 }) })
//!     }
//!
//!     fn subscribe(&self, _scope: &RemoteScope, _filter: &SubscriptionFilter) -> BoxFuture<'_, RemoteChannel> {
//!         Box::pin(async move {
//!             let (channel, _handle) = RemoteChannel::pair("ch-1", 16);
//!             Ok(channel)
//!         })
//!     }
//! }
//! ```

use crate::record::{Payload, Watermark};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Result type for remote operations.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Boxed future returned by [`RemoteStore`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RemoteResult<T>> + Send + 'a>>;

/// Error reported by the remote boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Connectivity problem; worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// The remote refused the request; retrying won't help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Tenant + table every remote call is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteScope {
    pub tenant_id: String,
    pub table: String,
}

/// A row as the remote store reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub key: String,
    pub payload: Payload,
    /// This row's own change watermark.
    pub watermark: Watermark,
    /// Tombstone: the row was deleted at `watermark`.
    pub deleted: bool,
}

impl RemoteRecord {
    pub fn new(key: impl Into<String>, payload: Payload, watermark: Watermark) -> Self {
        Self {
            key: key.into(),
            payload,
            watermark,
            deleted: false,
        }
    }

    pub fn tombstone(key: impl Into<String>, watermark: Watermark) -> Self {
        Self {
            key: key.into(),
            payload: Payload::new(),
            watermark,
            deleted: true,
        }
    }
}

/// Kind of realtime change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Insert,
    Update,
    Delete,
}

/// One realtime push event.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub op: RemoteOp,
    pub record: RemoteRecord,
    /// Server clock, millis since epoch.
    pub server_timestamp: i64,
}

impl RemoteEvent {
    /// The record this event leaves behind (deletes become tombstones).
    pub fn into_record(self) -> RemoteRecord {
        match self.op {
            RemoteOp::Delete => RemoteRecord {
                deleted: true,
                ..self.record
            },
            RemoteOp::Insert | RemoteOp::Update => self.record,
        }
    }
}

/// An optimistic write sent to the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePush {
    pub key: String,
    /// `None` deletes the row.
    pub payload: Option<Payload>,
    /// The server watermark this write was based on; mismatch → conflict.
    pub base_watermark: Watermark,
}

/// Remote's answer to a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Accepted; the row now has `watermark`.
    Ack { watermark: Watermark },
    /// The row moved on. `current` is its latest state if the remote sent it.
    Conflict { current: Option<RemoteRecord> },
}

/// Server-side filter expression for a realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub expression: String,
}

impl SubscriptionFilter {
    /// Tenant predicate, ANDed with an optional extra expression.
    pub fn for_tenant(tenant_id: &str, extra: Option<&str>) -> Self {
        let tenant = format!("tenant_id=eq.{}", tenant_id);
        let expression = match extra {
            Some(extra) if !extra.trim().is_empty() => format!("{}&{}", tenant, extra.trim()),
            _ => tenant,
        };
        Self { expression }
    }
}

/// Status of a realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    Errored(String),
    Closed,
}

/// What the channel produced next.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event(RemoteEvent),
    Status(ChannelStatus),
    /// The remote side went away.
    Ended,
}

/// Receiving half of a realtime channel, owned by the subscription bridge.
#[derive(Debug)]
pub struct RemoteChannel {
    id: String,
    status: watch::Receiver<ChannelStatus>,
    status_open: bool,
    events: mpsc::Receiver<RemoteEvent>,
}

/// Sending half, owned by the remote implementation.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: String,
    status: watch::Sender<ChannelStatus>,
    events: mpsc::Sender<RemoteEvent>,
}

impl RemoteChannel {
    /// New channel in `Connecting` state.
    pub fn pair(id: impl Into<String>, capacity: usize) -> (RemoteChannel, ChannelHandle) {
        let id = id.into();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        (
            RemoteChannel {
                id: id.clone(),
                status: status_rx,
                status_open: true,
                events: events_rx,
            },
            ChannelHandle {
                id,
                status: status_tx,
                events: events_tx,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Wait until the channel leaves `Connecting`.
    ///
    /// `Ok` once subscribed; `Err(reason)` if it errored, closed or the
    /// remote side went away first.
    pub async fn wait_subscribed(&mut self) -> Result<(), String> {
        loop {
            match &*self.status.borrow_and_update() {
                ChannelStatus::Subscribed => return Ok(()),
                ChannelStatus::Errored(reason) => return Err(reason.clone()),
                ChannelStatus::Closed => return Err("channel closed".to_string()),
                ChannelStatus::Connecting => {}
            }
            if self.status.changed().await.is_err() {
                self.status_open = false;
                return Err("channel dropped before subscribing".to_string());
            }
        }
    }

    /// Next event or status change. Cancel-safe.
    pub async fn next(&mut self) -> ChannelMessage {
        loop {
            if !self.status_open {
                return match self.events.recv().await {
                    Some(event) => ChannelMessage::Event(event),
                    None => ChannelMessage::Ended,
                };
            }
            tokio::select! {
                biased;
                changed = self.status.changed() => match changed {
                    Ok(()) => {
                        let status = self.status.borrow_and_update().clone();
                        return ChannelMessage::Status(status);
                    }
                    Err(_) => {
                        self.status_open = false;
                    }
                },
                event = self.events.recv() => {
                    return match event {
                        Some(event) => ChannelMessage::Event(event),
                        None => ChannelMessage::Ended,
                    };
                }
            }
        }
    }

    /// Drop the receiving side; the remote sees `is_closed()`.
    pub fn close(self) {
        debug!(channel = %self.id, "Channel closed");
    }
}

impl ChannelHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_status(&self, status: ChannelStatus) {
        self.status.send_replace(status);
    }

    /// Deliver an event. `false` if the channel was closed.
    pub async fn send(&self, event: RemoteEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// The remote store, as far as replication needs it.
pub trait RemoteStore: Send + Sync + 'static {
    /// All rows changed after `watermark`, each tagged with its own watermark.
    fn fetch_since(&self, scope: &RemoteScope, watermark: Watermark) -> BoxFuture<'_, Vec<RemoteRecord>>;

    /// Current state of one row, used to rebase after a conflict.
    fn fetch_row(&self, scope: &RemoteScope, key: &str) -> BoxFuture<'_, Option<RemoteRecord>>;

    /// Optimistic write.
    fn push(&self, scope: &RemoteScope, push: RemotePush) -> BoxFuture<'_, PushOutcome>;

    /// Open a realtime channel. It starts `Connecting`.
    fn subscribe(&self, scope: &RemoteScope, filter: &SubscriptionFilter) -> BoxFuture<'_, RemoteChannel>;
}

/// Remote that has nothing and accepts everything. Useful offline and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpRemote;

impl RemoteStore for NoOpRemote {
    fn fetch_since(&self, scope: &RemoteScope, watermark: Watermark) -> BoxFuture<'_, Vec<RemoteRecord>> {
        debug!(table = %scope.table, watermark, "NoOp: fetch_since");
        Box::pin(async { Ok(Vec::new()) })
    }

    fn fetch_row(&self, scope: &RemoteScope, key: &str) -> BoxFuture<'_, Option<RemoteRecord>> {
        debug!(table = %scope.table, key = %key, "NoOp: fetch_row");
        Box::pin(async { Ok(None) })
    }

    fn push(&self, scope: &RemoteScope, push: RemotePush) -> BoxFuture<'_, PushOutcome> {
        debug!(table = %scope.table, key = %push.key, "NoOp: push");
        Box::pin(async move {
            Ok(PushOutcome::Ack {
                watermark: push.base_watermark + 1,
            })
        })
    }

    fn subscribe(&self, scope: &RemoteScope, _filter: &SubscriptionFilter) -> BoxFuture<'_, RemoteChannel> {
        let id = format!("noop:{}", scope.table);
        Box::pin(async move {
            let (channel, handle) = RemoteChannel::pair(id, 1);
            handle.set_status(ChannelStatus::Subscribed);
            Ok(channel)
        })
    }
}
