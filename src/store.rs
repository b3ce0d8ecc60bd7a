// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local durable store (SQLite via sqlx).
//!
//! One process-wide [`LocalStore`] holds every replicated table. Table
//! transactions are serialized per table by the table's own guard, never
//! store-wide; SQLite (WAL) handles the rest.
//!
//! # Layout
//!
//! ```text
//! replica_records    (table_name, pk) → payload, watermark, dirty, synced_at
//! replica_meta       table_name → cursor, ttl_ms, eviction_policy
//! pending_mutations  (table_name, pk) → desired, base, attempts, generation, status
//! ```
//!
//! This layout is read by crash-recovery tooling only; it is not a public API.
//!
//! # Write transactions
//!
//! Writers open a deferred transaction and issue a write first. They never
//! SELECT before writing, so a transaction can't take a read snapshot and then
//! fail to upgrade. Decisions are made against the table's in-memory replica,
//! which the guard keeps identical to what is on disk.
//!
//! # SQLite Busy Handling
//!
//! `busy_timeout` covers contention inside transactions. Standalone writes
//! additionally go through [`execute_with_retry`] with capped backoff.

use crate::config::StoreConfig;
use crate::error::{ReplicaError, Result};
use crate::mutation::{MutationStatus, PendingMutation};
use crate::record::{Payload, ReplicaRecord, TableRegistration, Watermark};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// SQLITE_BUSY (5) / SQLITE_LOCKED (6).
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Run a standalone statement, retrying on SQLITE_BUSY/SQLITE_LOCKED.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(operation = operation_name, attempts, delay_ms, "SQLite busy, retrying");
                crate::metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

type RecordRow = (String, String, i64, i64, Option<i64>);

fn decode_record(row: RecordRow) -> Result<ReplicaRecord> {
    let (key, payload, watermark, dirty, synced_at) = row;
    Ok(ReplicaRecord {
        key,
        payload: serde_json::from_str::<Payload>(&payload)?,
        watermark,
        dirty: dirty != 0,
        synced_at,
    })
}

type MutationRow = (
    String,
    Option<String>,
    Option<String>,
    i64,
    i64,
    i64,
    i64,
    String,
    Option<String>,
);

fn decode_mutation(row: MutationRow) -> Result<PendingMutation> {
    let (key, desired, base, base_watermark, attempts, conflicts, generation, status, reason) = row;
    let decode = |s: Option<String>| -> Result<Option<Payload>> {
        s.map(|s| serde_json::from_str::<Payload>(&s))
            .transpose()
            .map_err(ReplicaError::from)
    };
    Ok(PendingMutation {
        key,
        desired: decode(desired)?,
        base: decode(base)?,
        base_watermark,
        attempts: attempts.max(0) as u32,
        conflicts: conflicts.max(0) as u32,
        generation: generation.max(0) as u64,
        status: match status.as_str() {
            "failed" => MutationStatus::Failed {
                reason: reason.unwrap_or_default(),
            },
            _ => MutationStatus::Pending,
        },
    })
}

fn encode_opt(payload: Option<&Payload>) -> Result<Option<String>> {
    payload
        .map(serde_json::to_string)
        .transpose()
        .map_err(ReplicaError::from)
}

/// Process-wide handle on the local SQLite database.
pub struct LocalStore {
    pool: SqlitePool,
    path: String,
}

impl LocalStore {
    /// Open (creating if needed) the store and its tables.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Opening local store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| ReplicaError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(2))
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replica_records (
                table_name TEXT NOT NULL,
                pk TEXT NOT NULL,
                payload TEXT NOT NULL,
                watermark INTEGER NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                synced_at INTEGER,
                PRIMARY KEY (table_name, pk)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replica_meta (
                table_name TEXT PRIMARY KEY,
                cursor INTEGER NOT NULL DEFAULT 0,
                ttl_ms INTEGER,
                eviction_policy TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_mutations (
                table_name TEXT NOT NULL,
                pk TEXT NOT NULL,
                desired TEXT,
                base TEXT,
                base_watermark INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                conflicts INTEGER NOT NULL DEFAULT 0,
                generation INTEGER NOT NULL,
                status TEXT NOT NULL,
                failed_reason TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (table_name, pk)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw pool, for recovery tooling and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record (or refresh) a table's metadata row, keeping its cursor.
    pub async fn register_meta(&self, registration: &TableRegistration, ttl: Option<Duration>) -> Result<()> {
        let eviction = serde_json::to_string(&registration.eviction)?;
        let ttl_ms = ttl.map(|d| d.as_millis() as i64);
        let now = now_ms();
        let pool = &self.pool;

        execute_with_retry("register_meta", || async {
            sqlx::query(
                r#"
                INSERT INTO replica_meta (table_name, cursor, ttl_ms, eviction_policy, updated_at)
                VALUES (?, 0, ?, ?, ?)
                ON CONFLICT(table_name) DO UPDATE SET
                    ttl_ms = excluded.ttl_ms,
                    eviction_policy = excluded.eviction_policy,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&registration.name)
            .bind(ttl_ms)
            .bind(&eviction)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(())
    }

    pub async fn load_records(&self, table: &str) -> Result<Vec<ReplicaRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT pk, payload, watermark, dirty, synced_at FROM replica_records WHERE table_name = ?",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_record).collect()
    }

    pub async fn load_cursor(&self, table: &str) -> Result<Option<Watermark>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT cursor FROM replica_meta WHERE table_name = ?")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(c,)| c))
    }

    pub async fn load_mutations(&self, table: &str) -> Result<Vec<PendingMutation>> {
        let rows: Vec<MutationRow> = sqlx::query_as(
            r#"
            SELECT pk, desired, base, base_watermark, attempts, conflicts, generation, status, failed_reason
            FROM pending_mutations WHERE table_name = ?
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_mutation).collect()
    }

    /// Begin a transaction scoped to one table.
    pub async fn begin(&self, table: &str) -> Result<StoreTx> {
        let tx = self.pool.begin().await?;
        Ok(StoreTx {
            tx,
            table: table.to_string(),
        })
    }

    /// Truncate the WAL into the main database file.
    pub async fn checkpoint(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        debug!(path = %self.path, "WAL checkpoint complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Local store closed");
    }
}

/// A transaction over one table's rows.
///
/// Dropped without `commit` it rolls back; [`abort`](Self::abort) rolls back
/// eagerly and waits for it.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
    table: String,
}

impl StoreTx {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn upsert_record(&mut self, record: &ReplicaRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        sqlx::query(
            r#"
            INSERT INTO replica_records (table_name, pk, payload, watermark, dirty, synced_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(table_name, pk) DO UPDATE SET
                payload = excluded.payload,
                watermark = excluded.watermark,
                dirty = excluded.dirty,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&self.table)
        .bind(&record.key)
        .bind(&payload)
        .bind(record.watermark)
        .bind(record.dirty as i64)
        .bind(record.synced_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn delete_record(&mut self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM replica_records WHERE table_name = ? AND pk = ?")
            .bind(&self.table)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Move the cursor forward (SQL `MAX` keeps it monotonic on disk too).
    pub async fn set_cursor(&mut self, watermark: Watermark) -> Result<()> {
        sqlx::query(
            "UPDATE replica_meta SET cursor = MAX(cursor, ?), updated_at = ? WHERE table_name = ?",
        )
        .bind(watermark)
        .bind(now_ms())
        .bind(&self.table)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_mutation(&mut self, mutation: &PendingMutation) -> Result<()> {
        let desired = encode_opt(mutation.desired.as_ref())?;
        let base = encode_opt(mutation.base.as_ref())?;
        sqlx::query(
            r#"
            INSERT INTO pending_mutations
                (table_name, pk, desired, base, base_watermark, attempts, conflicts,
                 generation, status, failed_reason, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(table_name, pk) DO UPDATE SET
                desired = excluded.desired,
                base = excluded.base,
                base_watermark = excluded.base_watermark,
                attempts = excluded.attempts,
                conflicts = excluded.conflicts,
                generation = excluded.generation,
                status = excluded.status,
                failed_reason = excluded.failed_reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.table)
        .bind(&mutation.key)
        .bind(desired)
        .bind(base)
        .bind(mutation.base_watermark)
        .bind(mutation.attempts as i64)
        .bind(mutation.conflicts as i64)
        .bind(mutation.generation as i64)
        .bind(mutation.status.as_str())
        .bind(mutation.failure_reason())
        .bind(now_ms())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn delete_mutation(&mut self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_mutations WHERE table_name = ? AND pk = ?")
            .bind(&self.table)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Read this table's rows inside the transaction.
    pub async fn fetch_records(&mut self) -> Result<Vec<ReplicaRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT pk, payload, watermark, dirty, synced_at FROM replica_records WHERE table_name = ? ORDER BY pk",
        )
        .bind(&self.table)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(decode_record).collect()
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll back now.
    pub async fn abort(self) -> Result<()> {
        let table = self.table;
        self.tx.rollback().await?;
        debug!(table = %table, "Transaction aborted");
        Ok(())
    }
}
