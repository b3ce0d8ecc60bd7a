// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime event coalescing.
//!
//! Collects push events per row (latest wins) and hands them to the table
//! in one apply once the window elapses or the batch is full.
//!
//! ```text
//! events ──▶ EventCoalescer ──▶ window / size ──▶ take() ──▶ rate limit ──▶ apply
//!              HashMap<key, latest>
//! ```
//!
//! "Latest" is the highest `(watermark, server_timestamp)`; an exact tie goes
//! to whichever arrived last. Ten updates to one row inside the window cost
//! one apply and one local change notification.

use crate::config::SubscriptionConfig;
use crate::remote::RemoteEvent;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Flush thresholds.
#[derive(Debug, Clone)]
pub struct CoalesceConfig {
    /// Flush once this long has passed since the first buffered event.
    pub window: Duration,
    /// Flush once this many distinct rows are buffered.
    pub max_batch: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(50),
            max_batch: 100,
        }
    }
}

impl CoalesceConfig {
    pub fn testing() -> Self {
        Self {
            window: Duration::from_millis(5),
            max_batch: 10,
        }
    }

    pub fn from_subscription(config: &SubscriptionConfig) -> Self {
        Self {
            window: config.coalesce_window(),
            max_batch: config.coalesce_max_batch.max(1),
        }
    }
}

/// Per-table buffer of the latest event per row.
#[derive(Debug)]
pub struct EventCoalescer {
    table: String,
    pending: HashMap<String, RemoteEvent>,
    batch_start: Option<Instant>,
    received: usize,
    config: CoalesceConfig,
}

impl EventCoalescer {
    pub fn new(table: impl Into<String>, config: CoalesceConfig) -> Self {
        Self {
            table: table.into(),
            pending: HashMap::new(),
            batch_start: None,
            received: 0,
            config,
        }
    }

    /// Buffer an event. An older version of a row already buffered is replaced;
    /// an older event arriving late is dropped.
    pub fn add(&mut self, event: RemoteEvent) {
        if self.batch_start.is_none() {
            self.batch_start = Some(Instant::now());
        }
        self.received += 1;

        let order = (event.record.watermark, event.server_timestamp);
        match self.pending.get(&event.record.key) {
            Some(existing) if (existing.record.watermark, existing.server_timestamp) > order => {
                debug!(table = %self.table, key = %event.record.key, "Dropped older event");
            }
            _ => {
                self.pending.insert(event.record.key.clone(), event);
            }
        }
    }

    pub fn should_flush(&self) -> bool {
        if self.pending.len() >= self.config.max_batch {
            return true;
        }
        self.batch_start
            .is_some_and(|start| start.elapsed() >= self.config.window)
    }

    /// When the current window closes, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.batch_start.map(|start| start + self.config.window)
    }

    /// Distinct rows buffered.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Raw events received since the last take.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Drain the buffer, ordered by watermark.
    pub fn take(&mut self) -> Vec<RemoteEvent> {
        let mut events: Vec<RemoteEvent> = self.pending.drain().map(|(_, e)| e).collect();
        events.sort_by_key(|e| (e.record.watermark, e.server_timestamp));

        crate::metrics::record_coalesce_flush(&self.table, self.received, events.len());
        debug!(
            table = %self.table,
            received = self.received,
            coalesced = events.len(),
            "Coalesced events flushed"
        );

        self.batch_start = None;
        self.received = 0;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteOp, RemoteRecord};
    use serde_json::json;

    fn event(key: &str, v: i64, watermark: i64, ts: i64) -> RemoteEvent {
        RemoteEvent {
            op: RemoteOp::Update,
            record: RemoteRecord::new(key, json!({"id": key, "v": v}).as_object().cloned().unwrap(), watermark),
            server_timestamp: ts,
        }
    }

    #[test]
    fn test_same_row_collapses_to_latest() {
        let mut c = EventCoalescer::new("entries", CoalesceConfig::testing());
        for v in 1..=5 {
            c.add(event("1", v, v, v));
        }
        assert_eq!(c.len(), 1);
        assert_eq!(c.received(), 5);

        let events = c.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.payload["v"], json!(5));
        assert!(c.is_empty());
        assert_eq!(c.received(), 0);
    }

    #[test]
    fn test_late_older_event_dropped() {
        let mut c = EventCoalescer::new("entries", CoalesceConfig::testing());
        c.add(event("1", 6, 6, 100));
        c.add(event("1", 5, 5, 200));
        assert_eq!(c.take()[0].record.watermark, 6);
    }

    #[test]
    fn test_tie_goes_to_later_arrival() {
        let mut c = EventCoalescer::new("entries", CoalesceConfig::testing());
        c.add(event("1", 1, 3, 10));
        c.add(event("1", 2, 3, 10));
        assert_eq!(c.take()[0].record.payload["v"], json!(2));
    }

    #[test]
    fn test_delete_after_update_wins() {
        let mut c = EventCoalescer::new("entries", CoalesceConfig::testing());
        c.add(event("1", 1, 1, 1));
        let mut delete = event("1", 1, 2, 2);
        delete.op = RemoteOp::Delete;
        c.add(delete);
        assert_eq!(c.take()[0].op, RemoteOp::Delete);
    }

    #[test]
    fn test_take_orders_by_watermark() {
        let mut c = EventCoalescer::new("entries", CoalesceConfig::testing());
        c.add(event("b", 1, 9, 0));
        c.add(event("a", 1, 4, 0));
        c.add(event("c", 1, 6, 0));
        let order: Vec<_> = c.take().into_iter().map(|e| e.record.watermark).collect();
        assert_eq!(order, vec![4, 6, 9]);
    }

    #[test]
    fn test_should_flush_by_size() {
        let mut c = EventCoalescer::new(
            "entries",
            CoalesceConfig {
                window: Duration::from_secs(60),
                max_batch: 3,
            },
        );
        c.add(event("a", 1, 1, 0));
        c.add(event("b", 1, 1, 0));
        assert!(!c.should_flush());
        c.add(event("c", 1, 1, 0));
        assert!(c.should_flush());
    }

    #[tokio::test]
    async fn test_should_flush_by_time() {
        let mut c = EventCoalescer::new(
            "entries",
            CoalesceConfig {
                window: Duration::from_millis(10),
                max_batch: 1000,
            },
        );
        assert!(c.deadline().is_none());
        c.add(event("a", 1, 1, 0));
        assert!(!c.should_flush());
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(c.should_flush());
    }
}
