// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table sync cursor.
//!
//! The cursor is the highest server watermark whose batch has been durably
//! applied. It is persisted in `replica_meta` in the same SQLite transaction
//! as the batch it covers, so a crash either keeps both or neither:
//!
//! ```text
//! fetch_since(cursor) → apply batch + write cursor → COMMIT → cache cursor
//!                       (crash before COMMIT = refetch same batch, idempotent)
//! ```
//!
//! It never moves backwards.

use crate::record::Watermark;
use serde::{Deserialize, Serialize};

/// Last-synced watermark of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub table: String,
    pub watermark: Watermark,
}

impl SyncCursor {
    /// Fresh table: fetch everything.
    pub fn start(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            watermark: 0,
        }
    }

    /// The cursor a committed batch would leave behind.
    ///
    /// `max(current, batch)`, so an older or replayed batch can't rewind it.
    pub fn advanced(&self, batch_watermark: Watermark) -> Self {
        Self {
            table: self.table.clone(),
            watermark: self.watermark.max(batch_watermark),
        }
    }

    pub fn would_advance(&self, batch_watermark: Watermark) -> bool {
        batch_watermark > self.watermark
    }
}
