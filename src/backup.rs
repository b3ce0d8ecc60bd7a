// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Debounced backup snapshots in a fallback SQLite file.
//!
//! One row per table, overwritten on every write:
//!
//! ```text
//! backup_snapshots  table_name → records (JSON), checksum (sha256 hex), snapshot_at
//! ```
//!
//! Used only for cold-start recovery when the main store comes up empty.
//! Never a source of truth.
//!
//! # Debounce
//!
//! Each [`request`](BackupStore::request) takes a ticket and sleeps for the
//! debounce window. Only the holder of the newest ticket writes; everyone
//! else reports `Coalesced`. Writes for a table are serialized by a per-table
//! mutex, so a request arriving mid-write waits for that write instead of
//! racing it.
//!
//! ```text
//! t=0   request #1 ─┐ sleep
//! t=10  request #2 ─┼─┐ sleep
//! t=30  #1 wakes: newer ticket exists → Coalesced
//! t=40  #2 wakes: newest → lock → write → Written
//! ```

use crate::error::{ReplicaError, Result};
use crate::record::ReplicaRecord;
use crate::store::execute_with_retry;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of a backup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// This request wrote the snapshot.
    Written { records: usize, checksum: String },
    /// A newer request superseded this one; it will write instead.
    Coalesced,
}

/// A verified snapshot loaded from the fallback store.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupSnapshot {
    pub table: String,
    pub records: Vec<ReplicaRecord>,
    pub checksum: String,
    pub snapshot_at: DateTime<Utc>,
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fallback store for table snapshots.
pub struct BackupStore {
    pool: SqlitePool,
    debounce: Duration,
    tickets: DashMap<String, u64>,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl BackupStore {
    pub async fn open(path: &str, debounce: Duration) -> Result<Self> {
        info!(path = %path, "Opening backup store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| ReplicaError::Config(format!("Invalid backup path: {}", e)))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_snapshots (
                table_name TEXT PRIMARY KEY,
                records TEXT NOT NULL,
                checksum TEXT NOT NULL,
                snapshot_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            debounce,
            tickets: DashMap::new(),
            writers: DashMap::new(),
        })
    }

    fn take_ticket(&self, table: &str) -> u64 {
        let mut entry = self.tickets.entry(table.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn is_latest(&self, table: &str, ticket: u64) -> bool {
        self.tickets.get(table).is_some_and(|t| *t == ticket)
    }

    fn writer(&self, table: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.writers
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Debounced snapshot request. `snapshot` is called only by the request
    /// that actually writes, so it sees the latest table state.
    pub async fn request<F>(&self, table: &str, snapshot: F) -> Result<BackupOutcome>
    where
        F: FnOnce() -> Vec<ReplicaRecord>,
    {
        let ticket = self.take_ticket(table);
        tokio::time::sleep(self.debounce).await;

        if !self.is_latest(table, ticket) {
            crate::metrics::record_backup_coalesced(table);
            return Ok(BackupOutcome::Coalesced);
        }

        let writer = self.writer(table);
        let _writing = writer.lock().await;

        // A newer request may have arrived while we waited on the writer.
        if !self.is_latest(table, ticket) {
            crate::metrics::record_backup_coalesced(table);
            return Ok(BackupOutcome::Coalesced);
        }

        self.write(table, &snapshot()).await
    }

    /// Write now, bypassing the debounce. Pending debounced requests for the
    /// table are superseded.
    pub async fn flush(&self, table: &str, records: &[ReplicaRecord]) -> Result<BackupOutcome> {
        self.take_ticket(table);
        let writer = self.writer(table);
        let _writing = writer.lock().await;
        self.write(table, records).await
    }

    async fn write(&self, table: &str, records: &[ReplicaRecord]) -> Result<BackupOutcome> {
        let start = Instant::now();
        let body = serde_json::to_string(records)?;
        let sum = checksum(body.as_bytes());
        let now = Utc::now().timestamp_millis();
        let pool = &self.pool;

        execute_with_retry("backup_write", || async {
            sqlx::query(
                r#"
                INSERT INTO backup_snapshots (table_name, records, checksum, snapshot_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(table_name) DO UPDATE SET
                    records = excluded.records,
                    checksum = excluded.checksum,
                    snapshot_at = excluded.snapshot_at
                "#,
            )
            .bind(table)
            .bind(&body)
            .bind(&sum)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(table = %table, records = records.len(), "Backup snapshot written");
        crate::metrics::record_backup_write(table, records.len(), start.elapsed());

        Ok(BackupOutcome::Written {
            records: records.len(),
            checksum: sum,
        })
    }

    /// Load and verify a table's snapshot.
    ///
    /// `Ok(None)` if there is none; `BackupCorrupt` if the checksum fails.
    pub async fn load(&self, table: &str) -> Result<Option<BackupSnapshot>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT records, checksum, snapshot_at FROM backup_snapshots WHERE table_name = ?",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        let Some((body, stored_sum, snapshot_at)) = row else {
            return Ok(None);
        };

        if checksum(body.as_bytes()) != stored_sum {
            warn!(table = %table, "Backup checksum mismatch, ignoring snapshot");
            return Err(ReplicaError::BackupCorrupt {
                table: table.to_string(),
            });
        }

        Ok(Some(BackupSnapshot {
            table: table.to_string(),
            records: serde_json::from_str(&body)?,
            checksum: stored_sum,
            snapshot_at: Utc
                .timestamp_millis_opt(snapshot_at)
                .single()
                .unwrap_or_else(Utc::now),
        }))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Raw pool, for recovery tooling and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
