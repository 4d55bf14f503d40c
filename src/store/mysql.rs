// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MySQL-backed node store.
//!
//! [`MySqlNode`] wraps one node's connection pool and implements every
//! [`SyncStore`] operation with real SQL: the claim transaction, the
//! suppressed replace/delete writes, the watermark queries, and the
//! `information_schema` existence checks.
//!
//! # Connection Lifecycle
//!
//! Connections are **lazy**: the pool is only built when first needed
//! (via `ensure_pool`). Connecting retries with exponential backoff per
//! the node's [`RetryConfig`]; every attempt is bounded by the config's
//! connection timeout so an unreachable host fails instead of hanging.
//!
//! # Claiming
//!
//! `claim_batch` runs a short transaction: `SELECT … FOR UPDATE SKIP
//! LOCKED` over claimable entries, then an `UPDATE` flipping them to
//! `processing` with the claim time stamped, then commit. Concurrent
//! drains skip each other's rows; entries stuck `processing` longer
//! than `reclaim_after` are claimed again.
//!
//! # Suppressed Writes
//!
//! `replace_row` and `delete_row` pin one pooled connection, activate
//! the capture-suppression sentinel on it, and run the write (for
//! replace, a delete+insert inside one transaction). See
//! [`crate::suppress`] for the sentinel discipline.

use std::time::Duration;

use chrono::NaiveDateTime;
use futures::future::BoxFuture;
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, Row};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::queue::{self, QueueDepth, QueueEntry, QueueStatus};
use crate::record::{self, Record, TableSpec};
use crate::resilience::RetryConfig;
use crate::store::{StoreFuture, SyncStore, WatermarkProbe};
use crate::suppress;

/// Default threshold after which `processing` entries are reclaimed.
const DEFAULT_RECLAIM_AFTER: Duration = Duration::from_secs(300);

/// One MySQL node as the engine sees it.
pub struct MySqlNode {
    label: String,
    config: NodeConfig,
    retry: RetryConfig,
    reclaim_after: Duration,
    /// Pool handle (None until the first successful connect).
    /// `MySqlPool` is cheap to clone and internally shared.
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlNode {
    /// Create a node store (not yet connected).
    pub fn new(label: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            label: label.into(),
            config,
            retry: RetryConfig::default(),
            reclaim_after: DEFAULT_RECLAIM_AFTER,
            pool: RwLock::new(None),
        }
    }

    /// Override the connection retry schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the `processing` reclaim threshold.
    pub fn with_reclaim_after(mut self, reclaim_after: Duration) -> Self {
        self.reclaim_after = reclaim_after;
        self
    }

    /// Get the pool if connected.
    pub async fn pool(&self) -> Option<MySqlPool> {
        self.pool.read().await.clone()
    }

    /// Connect to the node's MySQL with retry logic.
    pub async fn connect(&self) -> Result<()> {
        info!(node = %self.label, "Connecting to node");

        let options = MySqlPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout_duration())
            .idle_timeout(self.config.idle_timeout_duration());

        let mut attempt = 0;
        loop {
            attempt += 1;

            // One bounded attempt; connect() validates by acquiring.
            let conn_result = timeout(
                self.retry.connection_timeout,
                options.clone().connect(&self.config.url),
            )
            .await;

            let err = match conn_result {
                Ok(Ok(pool)) => {
                    *self.pool.write().await = Some(pool);
                    metrics::record_node_connection(&self.label, true);
                    if attempt > 1 {
                        info!(node = %self.label, attempt, "Connected to node after retry");
                    } else {
                        info!(node = %self.label, "Connected to node");
                    }
                    return Ok(());
                }
                Ok(Err(e)) => SyncError::connectivity(&self.label, e),
                Err(_) => SyncError::connectivity_msg(
                    &self.label,
                    format!(
                        "connection timed out after {}ms",
                        self.retry.connection_timeout.as_millis()
                    ),
                ),
            };

            if attempt >= self.retry.max_attempts {
                metrics::record_node_connection(&self.label, false);
                error!(
                    node = %self.label,
                    attempt,
                    error = %err,
                    "Failed to connect after max retries"
                );
                return Err(err);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                node = %self.label,
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Get the pool, connecting lazily if needed.
    pub(crate) async fn ensure_pool(&self) -> Result<MySqlPool> {
        if let Some(pool) = self.pool().await {
            return Ok(pool);
        }
        self.connect().await?;
        self.pool().await.ok_or_else(|| {
            SyncError::connectivity_msg(&self.label, "connection lost immediately after connect")
        })
    }

    /// Close the pool and drop all connections.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!(node = %self.label, "Node pool closed");
        }
    }

    /// Round-trip health check.
    pub async fn ping(&self) -> Result<()> {
        let pool = self.ensure_pool().await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| SyncError::from_db(&self.label, e))?;
        Ok(())
    }
}

// =============================================================================
// Row statement text
// =============================================================================
//
// Identifiers come from the validated TableSpec registry; row column
// names come off the wire from this node's own schema and are
// backtick-quoted. Values always go through bind parameters.

/// Full-row read by primary key. Binds: record id.
fn select_row_sql(spec: &TableSpec) -> String {
    format!(
        "SELECT * FROM {table} WHERE {pk} = ?",
        table = spec.name,
        pk = spec.primary_key,
    )
}

/// Row delete by primary key. Binds: record id.
fn delete_row_sql(spec: &TableSpec) -> String {
    format!(
        "DELETE FROM {table} WHERE {pk} = ?",
        table = spec.name,
        pk = spec.primary_key,
    )
}

/// Full-row insert for a fetched record. Binds: one value per column,
/// in the record's deterministic column order.
fn insert_row_sql(spec: &TableSpec, record: &Record) -> Result<String> {
    if record.is_empty() {
        return Err(SyncError::Internal(format!(
            "empty record for `{}`",
            spec.name
        )));
    }
    let mut columns = String::new();
    let mut marks = String::new();
    for (i, name) in record.column_names().enumerate() {
        if name.contains('`') {
            return Err(SyncError::Internal(format!(
                "unquotable column name on `{}`: {name}",
                spec.name
            )));
        }
        if i > 0 {
            columns.push_str(", ");
            marks.push_str(", ");
        }
        columns.push('`');
        columns.push_str(name);
        columns.push('`');
        marks.push('?');
    }
    Ok(format!(
        "INSERT INTO {table} ({columns}) VALUES ({marks})",
        table = spec.name,
    ))
}

/// Watermark scan for the fallback source side. Binds: since, limit.
fn scan_watermarks_sql(spec: &TableSpec, column: &str) -> String {
    format!(
        "SELECT {pk}, {col} FROM {table} \
         WHERE {col} >= ? \
         ORDER BY {col} ASC, {pk} ASC \
         LIMIT ?",
        table = spec.name,
        pk = spec.primary_key,
        col = column,
    )
}

/// Single-row watermark probe for the destination side. Binds: record id.
fn probe_watermark_sql(spec: &TableSpec, column: &str) -> String {
    format!(
        "SELECT {col} FROM {table} WHERE {pk} = ?",
        table = spec.name,
        pk = spec.primary_key,
        col = column,
    )
}

/// Classify a destination write failure: connectivity aborts the
/// direction, anything else is a per-entry apply error.
fn classify_write(label: &str, table: &str, record_id: i64, e: sqlx::Error) -> SyncError {
    match SyncError::from_db(label, e) {
        SyncError::Database(db) => SyncError::apply(table, record_id, &db),
        other => other,
    }
}

impl SyncStore for MySqlNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn claim_batch(&self, spec: &TableSpec, limit: u32) -> StoreFuture<'_, Vec<QueueEntry>> {
        let spec = spec.clone();
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            let reclaim_secs = self.reclaim_after.as_secs() as i64;

            let mut tx = pool
                .begin()
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;

            let rows = sqlx::query(&queue::claim_sql(&spec))
                .bind(reclaim_secs)
                .bind(limit)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;

            let mut entries = Vec::with_capacity(rows.len());
            for row in &rows {
                entries.push(queue::decode_entry(row)?);
            }
            if entries.is_empty() {
                tx.rollback()
                    .await
                    .map_err(|e| SyncError::from_db(&self.label, e))?;
                return Ok(entries);
            }

            let mark = queue::mark_processing_sql(&spec, entries.len());
            let mut query = sqlx::query(&mark);
            for entry in &entries {
                query = query.bind(entry.id);
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;

            tx.commit()
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;

            for entry in &mut entries {
                entry.status = QueueStatus::Processing;
            }
            Ok(entries)
        })
    }

    fn release_claims(&self, spec: &TableSpec, entry_ids: Vec<u64>) -> StoreFuture<'_, ()> {
        let spec = spec.clone();
        Box::pin(async move {
            if entry_ids.is_empty() {
                return Ok(());
            }
            let pool = self.ensure_pool().await?;
            let sql = queue::release_sql(&spec, entry_ids.len());
            let mut query = sqlx::query(&sql);
            for id in &entry_ids {
                query = query.bind(id);
            }
            query
                .execute(&pool)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;
            Ok(())
        })
    }

    fn ack_entry(&self, spec: &TableSpec, entry_id: u64) -> StoreFuture<'_, ()> {
        let spec = spec.clone();
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            sqlx::query(&queue::ack_sql(&spec))
                .bind(entry_id)
                .execute(&pool)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;
            Ok(())
        })
    }

    fn fail_entry(
        &self,
        spec: &TableSpec,
        entry_id: u64,
        next: QueueStatus,
    ) -> StoreFuture<'_, ()> {
        let spec = spec.clone();
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            sqlx::query(&queue::fail_sql(&spec))
                .bind(next.as_str())
                .bind(entry_id)
                .execute(&pool)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;
            Ok(())
        })
    }

    fn fetch_row(&self, spec: &TableSpec, record_id: i64) -> StoreFuture<'_, Option<Record>> {
        let sql = select_row_sql(spec);
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            let row = sqlx::query(&sql)
                .bind(record_id)
                .fetch_optional(&pool)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;
            row.as_ref().map(record::decode_row).transpose()
        })
    }

    fn replace_row(&self, spec: &TableSpec, record: Record) -> StoreFuture<'_, ()> {
        let table = spec.name.clone();
        let pk = spec.primary_key.clone();
        let delete_sql = delete_row_sql(spec);
        let insert_sql = insert_row_sql(spec, &record);
        Box::pin(async move {
            let insert_sql = insert_sql?;
            let record_id = record.id(&pk).ok_or_else(|| {
                SyncError::Internal(format!(
                    "record for `{table}` lacks integer primary key `{pk}`"
                ))
            })?;

            let pool = self.ensure_pool().await?;
            let conn = pool
                .acquire()
                .await
                .map_err(|e| SyncError::connectivity(&self.label, e))?;

            let label = self.label.clone();
            suppress::with_suppression(conn, move |conn: &mut MySqlConnection| {
                Box::pin(async move {
                    let mut tx = Connection::begin(conn)
                        .await
                        .map_err(|e| classify_write(&label, &table, record_id, e))?;
                    sqlx::query(&delete_sql)
                        .bind(record_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| classify_write(&label, &table, record_id, e))?;
                    let mut query = sqlx::query(&insert_sql);
                    for (_, value) in record.iter() {
                        query = value.bind_to(query);
                    }
                    query
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| classify_write(&label, &table, record_id, e))?;
                    tx.commit()
                        .await
                        .map_err(|e| classify_write(&label, &table, record_id, e))?;
                    Ok(())
                }) as BoxFuture<'_, Result<()>>
            })
            .await
        })
    }

    fn delete_row(&self, spec: &TableSpec, record_id: i64) -> StoreFuture<'_, bool> {
        let table = spec.name.clone();
        let sql = delete_row_sql(spec);
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            let conn = pool
                .acquire()
                .await
                .map_err(|e| SyncError::connectivity(&self.label, e))?;

            let label = self.label.clone();
            suppress::with_suppression(conn, move |conn: &mut MySqlConnection| {
                Box::pin(async move {
                    let result = sqlx::query(&sql)
                        .bind(record_id)
                        .execute(&mut *conn)
                        .await
                        .map_err(|e| classify_write(&label, &table, record_id, e))?;
                    Ok(result.rows_affected() > 0)
                }) as BoxFuture<'_, Result<bool>>
            })
            .await
        })
    }

    fn scan_watermarks(
        &self,
        spec: &TableSpec,
        since: NaiveDateTime,
        limit: u32,
    ) -> StoreFuture<'_, Vec<(i64, NaiveDateTime)>> {
        let column = spec.timestamp_column.clone();
        let spec = spec.clone();
        Box::pin(async move {
            let column = column.ok_or_else(|| SyncError::WatermarkMissing {
                node: self.label.clone(),
                table: spec.name.clone(),
                column: "sync_timestamp".to_string(),
            })?;
            let pool = self.ensure_pool().await?;
            let sql = scan_watermarks_sql(&spec, &column);
            let rows = sqlx::query(&sql)
                .bind(since)
                .bind(limit)
                .fetch_all(&pool)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;
            let mut hits = Vec::with_capacity(rows.len());
            for row in &rows {
                hits.push((
                    row.try_get::<i64, _>(0)?,
                    row.try_get::<NaiveDateTime, _>(1)?,
                ));
            }
            Ok(hits)
        })
    }

    fn probe_watermark(
        &self,
        spec: &TableSpec,
        record_id: i64,
    ) -> StoreFuture<'_, WatermarkProbe> {
        let column = spec
            .timestamp_column
            .clone()
            .unwrap_or_else(|| "sync_timestamp".to_string());
        let sql = probe_watermark_sql(spec, &column);
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            let row = sqlx::query(&sql)
                .bind(record_id)
                .fetch_optional(&pool)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;
            Ok(match row {
                None => WatermarkProbe::Missing,
                Some(row) => match row.try_get::<Option<NaiveDateTime>, _>(0)? {
                    Some(ts) => WatermarkProbe::At(ts),
                    None => WatermarkProbe::Unstamped,
                },
            })
        })
    }

    fn has_watermark_column(&self, spec: &TableSpec) -> StoreFuture<'_, bool> {
        let table = spec.name.clone();
        let column = spec.timestamp_column.clone();
        Box::pin(async move {
            let Some(column) = column else {
                return Ok(false);
            };
            let pool = self.ensure_pool().await?;
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?",
            )
            .bind(&table)
            .bind(&column)
            .fetch_one(&pool)
            .await
            .map_err(|e| SyncError::from_db(&self.label, e))?;
            Ok(count > 0)
        })
    }

    fn has_queue_table(&self, spec: &TableSpec) -> StoreFuture<'_, bool> {
        let queue_table = spec.queue_table.clone();
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?",
            )
            .bind(&queue_table)
            .fetch_one(&pool)
            .await
            .map_err(|e| SyncError::from_db(&self.label, e))?;
            Ok(count > 0)
        })
    }

    fn has_capture_triggers(&self, spec: &TableSpec) -> StoreFuture<'_, bool> {
        let table = spec.name.clone();
        let [insert, update, delete] = spec.trigger_names();
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM information_schema.triggers \
                 WHERE trigger_schema = DATABASE() AND event_object_table = ? \
                   AND trigger_name IN (?, ?, ?)",
            )
            .bind(&table)
            .bind(&insert)
            .bind(&update)
            .bind(&delete)
            .fetch_one(&pool)
            .await
            .map_err(|e| SyncError::from_db(&self.label, e))?;
            Ok(count == 3)
        })
    }

    fn queue_depth(&self, spec: &TableSpec) -> StoreFuture<'_, QueueDepth> {
        let sql = queue::depth_sql(spec);
        Box::pin(async move {
            let pool = self.ensure_pool().await?;
            let rows = sqlx::query(&sql)
                .fetch_all(&pool)
                .await
                .map_err(|e| SyncError::from_db(&self.label, e))?;
            let mut depth = QueueDepth::default();
            for row in &rows {
                let status: String = row.try_get("status")?;
                let n = row.try_get::<i64, _>("n")?.max(0) as u64;
                match QueueStatus::from_str(&status) {
                    Some(QueueStatus::Pending) => depth.pending = n,
                    Some(QueueStatus::Processing) => depth.processing = n,
                    Some(QueueStatus::Failed) => depth.failed = n,
                    None => {
                        return Err(SyncError::Internal(format!(
                            "unknown queue status `{status}`"
                        )))
                    }
                }
            }
            Ok(depth)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SqlValue;

    fn spec() -> TableSpec {
        TableSpec::new("guests", "id").with_timestamp_column("sync_timestamp")
    }

    #[test]
    fn test_select_row_sql() {
        assert_eq!(select_row_sql(&spec()), "SELECT * FROM guests WHERE id = ?");
    }

    #[test]
    fn test_delete_row_sql() {
        assert_eq!(delete_row_sql(&spec()), "DELETE FROM guests WHERE id = ?");
    }

    #[test]
    fn test_insert_row_sql_quotes_and_orders_columns() {
        let mut record = Record::new();
        record.set("remark", SqlValue::Text("X".into()));
        record.set("id", SqlValue::Int(1));
        let sql = insert_row_sql(&spec(), &record).unwrap();
        // BTreeMap order: id before remark.
        assert_eq!(sql, "INSERT INTO guests (`id`, `remark`) VALUES (?, ?)");
    }

    #[test]
    fn test_insert_row_sql_rejects_empty_record() {
        let record = Record::new();
        assert!(insert_row_sql(&spec(), &record).is_err());
    }

    #[test]
    fn test_insert_row_sql_rejects_backtick_column() {
        let mut record = Record::new();
        record.set("bad`name", SqlValue::Int(1));
        assert!(insert_row_sql(&spec(), &record).is_err());
    }

    #[test]
    fn test_scan_watermarks_sql_shape() {
        let sql = scan_watermarks_sql(&spec(), "sync_timestamp");
        assert!(sql.contains("WHERE sync_timestamp >= ?"));
        assert!(sql.contains("ORDER BY sync_timestamp ASC, id ASC"));
        assert!(sql.contains("LIMIT ?"));
    }

    #[test]
    fn test_probe_watermark_sql_shape() {
        let sql = probe_watermark_sql(&spec(), "sync_timestamp");
        assert_eq!(sql, "SELECT sync_timestamp FROM guests WHERE id = ?");
    }

    #[test]
    fn test_classify_write_apply_vs_connectivity() {
        let err = classify_write("remote", "guests", 42, sqlx::Error::RowNotFound);
        assert!(matches!(err, SyncError::Apply { .. }));
        assert!(!err.is_connectivity());

        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        let err = classify_write("remote", "guests", 42, io);
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_node_starts_disconnected() {
        let node = MySqlNode::new("local", NodeConfig::for_testing("mysql://u:p@h:3306/db"));
        assert!(node.pool().await.is_none());
        assert_eq!(node.label(), "local");
    }

    #[test]
    fn test_reclaim_default() {
        let node = MySqlNode::new("local", NodeConfig::for_testing("mysql://u:p@h:3306/db"));
        assert_eq!(node.reclaim_after, DEFAULT_RECLAIM_AFTER);
        let node = node.with_reclaim_after(Duration::from_secs(60));
        assert_eq!(node.reclaim_after, Duration::from_secs(60));
    }
}
