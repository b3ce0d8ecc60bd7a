// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory remote store for tests.
//!
//! Behaves like an authoritative server: every row carries its own change
//! watermark from a single server clock, and pushes are optimistic (a push
//! whose `base_watermark` doesn't match the row's current watermark is a
//! conflict). Failures, delays and channel behaviour are injectable.
//!
//! # Example
//! ```rust,ignore
//! let remote = Arc::new(MockRemote::new("club-1"));
//! remote.seed("entries", "1", payload(json!({"v": 1})));
//! remote.fail_next_pushes(2);
//! remote.set_subscribe_mode("classes", SubscribeMode::Never);
//! ```

use parking_lot::Mutex;
use replica_engine::remote::{
    BoxFuture, ChannelHandle, ChannelStatus, PushOutcome, RemoteChannel, RemoteError, RemoteEvent, RemoteOp, RemotePush,
    RemoteRecord, RemoteScope, RemoteStore, SubscriptionFilter,
};
use replica_engine::{Payload, Watermark};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

/// How `subscribe()` behaves for a table.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeMode {
    /// Channel reports subscribed right away.
    Immediate,
    /// Channel reports subscribed after the delay.
    Delayed(Duration),
    /// Channel stays connecting forever.
    Never,
    /// Channel reports an error instead of subscribing.
    Errored(String),
    /// The subscribe call itself fails.
    Fail,
}

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FetchSince { table: String, watermark: Watermark },
    FetchRow { table: String, key: String },
    Push { table: String, key: String, base: Watermark },
    Subscribe { table: String, filter: String },
}

impl Call {
    pub fn table(&self) -> &str {
        match self {
            Call::FetchSince { table, .. }
            | Call::FetchRow { table, .. }
            | Call::Push { table, .. }
            | Call::Subscribe { table, .. } => table,
        }
    }
}

pub struct MockRemote {
    tenant_id: String,
    clock: AtomicI64,
    rows: Mutex<HashMap<String, BTreeMap<String, RemoteRecord>>>,
    channels: Mutex<HashMap<String, Vec<ChannelHandle>>>,
    subscribe_modes: Mutex<HashMap<String, SubscribeMode>>,
    default_mode: Mutex<SubscribeMode>,
    calls: Mutex<Vec<Call>>,
    /// Transient push failures still to inject
    push_failures: AtomicUsize,
    /// Transient fetch failures still to inject
    fetch_failures: AtomicUsize,
    /// Every push is rejected outright
    reject_pushes: AtomicBool,
    /// Every remote call fails (outage)
    offline: AtomicBool,
    push_delay: Mutex<Duration>,
    fetch_delay: Mutex<Duration>,
}

impl MockRemote {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            clock: AtomicI64::new(0),
            rows: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            subscribe_modes: Mutex::new(HashMap::new()),
            default_mode: Mutex::new(SubscribeMode::Immediate),
            calls: Mutex::new(Vec::new()),
            push_failures: AtomicUsize::new(0),
            fetch_failures: AtomicUsize::new(0),
            reject_pushes: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            push_delay: Mutex::new(Duration::ZERO),
            fetch_delay: Mutex::new(Duration::ZERO),
        }
    }

    // =========================================================================
    // Server-side data
    // =========================================================================

    fn tick(&self) -> Watermark {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Store a row without notifying channels.
    pub fn seed(&self, table: &str, key: &str, payload: Payload) -> Watermark {
        let watermark = self.tick();
        self.rows
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), RemoteRecord::new(key, payload, watermark));
        watermark
    }

    /// Another client updates a row: store it and notify open channels.
    pub async fn server_update(&self, table: &str, key: &str, payload: Payload) -> Watermark {
        let watermark = self.seed(table, key, payload.clone());
        let event = RemoteEvent {
            op: RemoteOp::Update,
            record: RemoteRecord::new(key, payload, watermark),
            server_timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.emit(table, event).await;
        watermark
    }

    /// Another client deletes a row: tombstone it and notify open channels.
    pub async fn server_delete(&self, table: &str, key: &str) -> Watermark {
        let watermark = self.tick();
        self.rows
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), RemoteRecord::tombstone(key, watermark));
        let event = RemoteEvent {
            op: RemoteOp::Delete,
            record: RemoteRecord::tombstone(key, watermark),
            server_timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.emit(table, event).await;
        watermark
    }

    pub fn row(&self, table: &str, key: &str) -> Option<RemoteRecord> {
        self.rows.lock().get(table).and_then(|rows| rows.get(key)).cloned()
    }

    pub fn watermark(&self) -> Watermark {
        self.clock.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Channels
    // =========================================================================

    pub fn set_default_subscribe_mode(&self, mode: SubscribeMode) {
        *self.default_mode.lock() = mode;
    }

    pub fn set_subscribe_mode(&self, table: &str, mode: SubscribeMode) {
        self.subscribe_modes.lock().insert(table.to_string(), mode);
    }

    /// Deliver an event to every open channel for `table`. Returns how many
    /// channels took it.
    pub async fn emit(&self, table: &str, event: RemoteEvent) -> usize {
        let handles: Vec<ChannelHandle> = self.channels.lock().get(table).cloned().unwrap_or_default();
        let mut delivered = 0;
        for handle in handles {
            if !handle.is_closed() && handle.send(event.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Push a status to every channel for `table` (e.g. a mid-stream error).
    pub fn set_channel_status(&self, table: &str, status: ChannelStatus) {
        if let Some(handles) = self.channels.lock().get(table) {
            for handle in handles {
                handle.set_status(status.clone());
            }
        }
    }

    pub fn open_channels(&self, table: &str) -> usize {
        self.channels
            .lock()
            .get(table)
            .map(|handles| handles.iter().filter(|h| !h.is_closed()).count())
            .unwrap_or(0)
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    pub fn fail_next_pushes(&self, n: usize) {
        self.push_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    pub fn reject_pushes(&self, reject: bool) {
        self.reject_pushes.store(reject, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock() = delay;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // =========================================================================
    // Call recording
    // =========================================================================

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn fetch_count(&self, table: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::FetchSince { table: t, .. } if t == table))
            .count()
    }

    pub fn push_count(&self, table: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Push { table: t, .. } if t == table))
            .count()
    }

    pub fn subscribe_filters(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Subscribe { filter, .. } => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check_scope(&self, scope: &RemoteScope) -> Result<(), RemoteError> {
        if scope.tenant_id != self.tenant_id {
            return Err(RemoteError::Rejected(format!("tenant {} not allowed", scope.tenant_id)));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transient("network unreachable".to_string()));
        }
        Ok(())
    }
}

impl RemoteStore for MockRemote {
    fn fetch_since(&self, scope: &RemoteScope, watermark: Watermark) -> BoxFuture<'_, Vec<RemoteRecord>> {
        self.record(Call::FetchSince {
            table: scope.table.clone(),
            watermark,
        });
        let scope = scope.clone();
        Box::pin(async move {
            let delay = *self.fetch_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.check_scope(&scope)?;
            if Self::take_failure(&self.fetch_failures) {
                return Err(RemoteError::Transient("fetch failed".to_string()));
            }

            let mut records: Vec<RemoteRecord> = self
                .rows
                .lock()
                .get(&scope.table)
                .map(|rows| rows.values().filter(|r| r.watermark > watermark).cloned().collect())
                .unwrap_or_default();
            records.sort_by_key(|r| r.watermark);
            Ok(records)
        })
    }

    fn fetch_row(&self, scope: &RemoteScope, key: &str) -> BoxFuture<'_, Option<RemoteRecord>> {
        self.record(Call::FetchRow {
            table: scope.table.clone(),
            key: key.to_string(),
        });
        let scope = scope.clone();
        let key = key.to_string();
        Box::pin(async move {
            self.check_scope(&scope)?;
            Ok(self.row(&scope.table, &key))
        })
    }

    fn push(&self, scope: &RemoteScope, push: RemotePush) -> BoxFuture<'_, PushOutcome> {
        self.record(Call::Push {
            table: scope.table.clone(),
            key: push.key.clone(),
            base: push.base_watermark,
        });
        let scope = scope.clone();
        Box::pin(async move {
            let delay = *self.push_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.check_scope(&scope)?;
            if Self::take_failure(&self.push_failures) {
                return Err(RemoteError::Transient("connection reset".to_string()));
            }
            if self.reject_pushes.load(Ordering::SeqCst) {
                return Err(RemoteError::Rejected("row-level security violation".to_string()));
            }

            let mut rows = self.rows.lock();
            let table = rows.entry(scope.table.clone()).or_default();
            let current = table.get(&push.key).cloned();
            let current_watermark = current.as_ref().map(|r| r.watermark).unwrap_or(0);
            if current_watermark != push.base_watermark {
                return Ok(PushOutcome::Conflict { current });
            }

            let watermark = self.tick();
            let record = match push.payload {
                Some(payload) => RemoteRecord::new(push.key.clone(), payload, watermark),
                None => RemoteRecord::tombstone(push.key.clone(), watermark),
            };
            table.insert(push.key, record);
            Ok(PushOutcome::Ack { watermark })
        })
    }

    fn subscribe(&self, scope: &RemoteScope, filter: &SubscriptionFilter) -> BoxFuture<'_, RemoteChannel> {
        self.record(Call::Subscribe {
            table: scope.table.clone(),
            filter: filter.expression.clone(),
        });
        let scope = scope.clone();
        Box::pin(async move {
            self.check_scope(&scope)?;
            let mode = self
                .subscribe_modes
                .lock()
                .get(&scope.table)
                .cloned()
                .unwrap_or_else(|| self.default_mode.lock().clone());
            if mode == SubscribeMode::Fail {
                return Err(RemoteError::Transient("realtime endpoint unavailable".to_string()));
            }

            let id = format!("{}:{}:{}", scope.tenant_id, scope.table, self.calls.lock().len());
            let (channel, handle) = RemoteChannel::pair(id, 64);
            match mode {
                SubscribeMode::Immediate => handle.set_status(ChannelStatus::Subscribed),
                SubscribeMode::Delayed(delay) => {
                    let delayed = handle.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        delayed.set_status(ChannelStatus::Subscribed);
                    });
                }
                SubscribeMode::Errored(reason) => handle.set_status(ChannelStatus::Errored(reason)),
                SubscribeMode::Never | SubscribeMode::Fail => {}
            }
            self.channels.lock().entry(scope.table.clone()).or_default().push(handle);
            Ok(channel)
        })
    }
}
