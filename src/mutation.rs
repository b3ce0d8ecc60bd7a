// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pending optimistic writes and the per-row locks that govern their push.
//!
//! # Generations
//!
//! Every local write gets a fresh generation from the table's [`RowLocks`].
//! A push captures a [`LockToken`] (key + generation) before it goes to the
//! network. When it comes back, the outcome is applied only if the row's
//! pending mutation still has that generation; otherwise a newer write has
//! superseded it and the stale outcome is discarded.
//!
//! ```text
//! put(v1) gen=4 ──push(token gen=4)────────────────► ack
//! put(v2) gen=5 ─┐                                   │
//!                └ pending.generation = 5 ◄──────────┘ token stale: no-op
//! ```
//!
//! # Claims
//!
//! At most one push per row is in flight. [`RowLocks::claim`] hands out a
//! [`RowClaim`] that releases the row on drop; a second claim for the same
//! row is refused and surfaces as `LockBusy`.

use crate::record::{Payload, Watermark};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be pushed (or between retries).
    Pending,
    /// Rejected by the remote or out of conflict budget. Held until retried
    /// or discarded.
    Failed { reason: String },
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed { .. } => "failed",
        }
    }
}

/// An optimistic write not yet confirmed by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Row key.
    pub key: String,
    /// Desired row contents. `None` means delete.
    pub desired: Option<Payload>,
    /// Server row the intent was made against (`None` for inserts).
    pub base: Option<Payload>,
    /// Watermark of `base`; sent with the push for conflict detection.
    pub base_watermark: Watermark,
    /// Transient push failures so far.
    pub attempts: u32,
    /// Conflicts rebased so far.
    pub conflicts: u32,
    /// Identity of this intent; bumped by every local write to the row.
    pub generation: u64,
    pub status: MutationStatus,
}

impl PendingMutation {
    pub fn token(&self) -> LockToken {
        LockToken {
            key: self.key.clone(),
            generation: self.generation,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, MutationStatus::Failed { .. })
    }

    pub fn is_delete(&self) -> bool {
        self.desired.is_none()
    }

    /// A local insert the remote has never seen. A restored or rebased
    /// intent has no base payload but still carries the server watermark.
    pub fn is_local_insert(&self) -> bool {
        self.base.is_none() && self.base_watermark == 0
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            MutationStatus::Failed { reason } => Some(reason),
            MutationStatus::Pending => None,
        }
    }
}

/// Identity of the mutation a push was started for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    pub key: String,
    pub generation: u64,
}

impl LockToken {
    /// Whether this token still names the row's current intent.
    pub fn is_current(&self, current: Option<&PendingMutation>) -> bool {
        current.is_some_and(|m| m.generation == self.generation)
    }
}

/// Per-table row claim set plus the generation counter.
#[derive(Debug)]
pub struct RowLocks {
    claimed: Arc<Mutex<HashSet<String>>>,
    generation: AtomicU64,
}

impl RowLocks {
    /// `start_after` is the highest generation already persisted.
    pub fn new(start_after: u64) -> Self {
        Self {
            claimed: Arc::new(Mutex::new(HashSet::new())),
            generation: AtomicU64::new(start_after),
        }
    }

    /// Allocate a fresh generation. Any token holding an older one is stale.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim a row for pushing. `None` if already claimed.
    pub fn claim(&self, key: &str) -> Option<RowClaim> {
        let mut claimed = self.claimed.lock();
        if !claimed.insert(key.to_string()) {
            return None;
        }
        Some(RowClaim {
            key: key.to_string(),
            claimed: Arc::clone(&self.claimed),
        })
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        self.claimed.lock().contains(key)
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }
}

/// Exclusive push rights for one row; released on drop.
#[derive(Debug)]
pub struct RowClaim {
    key: String,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl RowClaim {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RowClaim {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.key);
    }
}
