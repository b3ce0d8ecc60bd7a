// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eviction planning.
//!
//! Pure selection over a snapshot; the table applies the plan under its guard.
//! Dirty rows and rows with a pending mutation are never candidates.

use crate::record::{EvictionPolicy, ReplicaRecord};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// What one eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub ttl_evicted: usize,
    pub lru_evicted: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.ttl_evicted + self.lru_evicted
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct EvictionPlan {
    pub ttl: Vec<String>,
    pub lru: Vec<String>,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.ttl.is_empty() && self.lru.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.ttl.iter().chain(self.lru.iter())
    }

    pub fn report(&self) -> EvictionReport {
        EvictionReport {
            ttl_evicted: self.ttl.len(),
            lru_evicted: self.lru.len(),
        }
    }
}

pub(crate) fn plan_evictions<P, A>(
    rows: &BTreeMap<String, ReplicaRecord>,
    is_pending: P,
    policy: EvictionPolicy,
    ttl: Option<Duration>,
    now_ms: i64,
    last_access: A,
) -> EvictionPlan
where
    P: Fn(&str) -> bool,
    A: Fn(&str) -> Option<i64>,
{
    let evictable = |r: &ReplicaRecord| !r.dirty && !is_pending(&r.key);
    let mut plan = EvictionPlan::default();

    if let (true, Some(ttl)) = (policy.uses_ttl(), ttl) {
        let ttl_ms = ttl.as_millis() as i64;
        plan.ttl = rows
            .values()
            .filter(|r| evictable(r))
            .filter(|r| r.synced_at.is_some_and(|t| now_ms.saturating_sub(t) > ttl_ms))
            .map(|r| r.key.clone())
            .collect();
    }

    if let Some(max_records) = policy.max_records() {
        let remaining = rows.len() - plan.ttl.len();
        if remaining > max_records {
            let gone: HashSet<&String> = plan.ttl.iter().collect();
            let mut candidates: Vec<(i64, &String)> = rows
                .values()
                .filter(|r| evictable(r) && !gone.contains(&r.key))
                .map(|r| {
                    let seen = last_access(&r.key).or(r.synced_at).unwrap_or(0);
                    (seen, &r.key)
                })
                .collect();
            candidates.sort();
            plan.lru = candidates
                .into_iter()
                .take(remaining - max_records)
                .map(|(_, key)| key.clone())
                .collect();
        }
    }

    plan
}
