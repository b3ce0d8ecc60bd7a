// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read results, explicit transactions and the local change feed.

use crate::error::Result;
use crate::record::ReplicaRecord;
use crate::store::StoreTx;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedSemaphorePermit};
use tracing::warn;

/// Shared row predicate.
pub type Predicate = Arc<dyn Fn(&ReplicaRecord) -> bool + Send + Sync>;

/// Immutable view of a table at one instant.
pub type Snapshot = Arc<BTreeMap<String, ReplicaRecord>>;

/// Result of [`ReplicatedTable::query`](super::ReplicatedTable::query).
///
/// Holds the snapshot taken at call time. Iteration is lazy and can be
/// restarted; later writes and evictions never change what it yields.
#[derive(Clone)]
pub struct QueryResult {
    snapshot: Snapshot,
    predicate: Predicate,
}

impl QueryResult {
    pub(crate) fn new(snapshot: Snapshot, predicate: Predicate) -> Self {
        Self { snapshot, predicate }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaRecord> + '_ {
        let predicate = &self.predicate;
        self.snapshot.values().filter(move |r| predicate(r))
    }

    pub fn to_vec(&self) -> Vec<ReplicaRecord> {
        self.iter().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.iter().map(|r| r.key.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("snapshot_len", &self.snapshot.len())
            .finish_non_exhaustive()
    }
}

/// A table transaction holding the table's single-flight guard.
///
/// Reads see the durable rows. Dropping it rolls back and releases the guard;
/// [`abort`](Self::abort) does the same eagerly.
pub struct TableTransaction {
    tx: StoreTx,
    _permit: OwnedSemaphorePermit,
}

impl TableTransaction {
    pub(crate) fn new(tx: StoreTx, permit: OwnedSemaphorePermit) -> Self {
        Self { tx, _permit: permit }
    }

    pub fn table(&self) -> &str {
        self.tx.table()
    }

    /// Rows matching `predicate`, ordered by key.
    pub async fn scan<F>(&mut self, predicate: F) -> Result<Vec<ReplicaRecord>>
    where
        F: Fn(&ReplicaRecord) -> bool,
    {
        let rows = self.tx.fetch_records().await?;
        Ok(rows.into_iter().filter(|r| predicate(r)).collect())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await
    }

    pub async fn abort(self) -> Result<()> {
        self.tx.abort().await
    }
}

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upserted,
    Deleted,
    Evicted,
    /// The remote confirmed the row's pending mutation.
    Confirmed,
    /// The row's pending mutation gave up and needs attention.
    MutationFailed,
}

/// Who caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    Eviction,
    Push,
}

/// One entry of the local change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    pub table: String,
    pub key: String,
    pub kind: ChangeKind,
    pub origin: ChangeOrigin,
    /// Row after the change, or the row as it was for removals.
    pub record: Option<ReplicaRecord>,
}

/// Selects which changes a [`LocalSubscription`] sees.
#[derive(Clone, Default)]
pub enum LocalFilter {
    #[default]
    All,
    Key(String),
    Predicate(Predicate),
}

impl LocalFilter {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ReplicaRecord) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, change: &LocalChange) -> bool {
        match self {
            Self::All => true,
            Self::Key(key) => &change.key == key,
            Self::Predicate(p) => change.record.as_ref().is_some_and(|r| p(r)),
        }
    }
}

impl fmt::Debug for LocalFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Receiver side of [`ReplicatedTable::subscribe_local`](super::ReplicatedTable::subscribe_local).
pub struct LocalSubscription {
    table: String,
    rx: broadcast::Receiver<LocalChange>,
    filter: LocalFilter,
}

impl LocalSubscription {
    pub(crate) fn new(table: String, rx: broadcast::Receiver<LocalChange>, filter: LocalFilter) -> Self {
        Self { table, rx, filter }
    }

    /// Next matching change; `None` once the table is gone.
    ///
    /// A subscriber that falls behind skips what it missed.
    pub async fn recv(&mut self) -> Option<LocalChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.filter.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(table = %self.table, missed, "Local subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<LocalChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.filter.matches(&change) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl fmt::Debug for LocalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSubscription")
            .field("table", &self.table)
            .field("filter", &self.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Payload;
    use serde_json::json;

    fn rec(key: &str, v: i64) -> ReplicaRecord {
        ReplicaRecord::from_server(key, json!({"v": v}).as_object().cloned().unwrap(), v, 0)
    }

    fn change(key: &str, record: Option<ReplicaRecord>) -> LocalChange {
        LocalChange {
            table: "entries".into(),
            key: key.into(),
            kind: ChangeKind::Upserted,
            origin: ChangeOrigin::Local,
            record,
        }
    }

    #[test]
    fn test_query_result_is_restartable() {
        let snapshot: Snapshot = Arc::new(
            [rec("1", 1), rec("2", 2), rec("3", 3)]
                .into_iter()
                .map(|r| (r.key.clone(), r))
                .collect(),
        );
        let result = QueryResult::new(snapshot, Arc::new(|r: &ReplicaRecord| r.watermark >= 2));
        assert_eq!(result.keys(), vec!["2", "3"]);
        assert_eq!(result.keys(), vec!["2", "3"]);
        assert_eq!(result.count(), 2);
        assert!(!result.is_empty());
    }

    #[test]
    fn test_filters() {
        let c = change("7", Some(rec("7", 3)));
        assert!(LocalFilter::All.matches(&c));
        assert!(LocalFilter::Key("7".into()).matches(&c));
        assert!(!LocalFilter::Key("8".into()).matches(&c));
        assert!(LocalFilter::predicate(|r| r.watermark == 3).matches(&c));
        assert!(!LocalFilter::predicate(|_| true).matches(&change("7", None)));
    }

    #[tokio::test]
    async fn test_subscription_filters_and_closes() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = LocalSubscription::new("entries".into(), rx, LocalFilter::Key("2".into()));

        tx.send(change("1", None)).unwrap();
        tx.send(change("2", Some(ReplicaRecord::from_server("2", Payload::new(), 1, 0))))
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().key, "2");

        drop(tx);
        assert!(sub.recv().await.is_none());
    }
}
