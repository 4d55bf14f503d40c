// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue entry model and SQL for the per-table change queues.
//!
//! Every participating table has one queue table per node (see
//! [`TableSpec::queue_table`]). Capture triggers append to it; the
//! engine claims batches from it, applies them to the peer, and
//! removes or fails them. This module owns the entry types and the
//! statement text; execution lives in the stores.
//!
//! # Entry Lifecycle
//!
//! ```text
//! (trigger) → pending → processing → removed     (applied)
//!                 ↑         |
//!                 └─────────┤ attempts += 1      (retryable failure)
//!                           └→ failed            (budget exhausted)
//! ```
//!
//! Claims run `FOR UPDATE SKIP LOCKED` in a short transaction that
//! marks the batch `processing` and stamps the claim time, so
//! concurrent drains never double-claim. Entries left `processing` by
//! a crashed invocation become claimable again after the reclaim
//! threshold; replaying them is safe because application is idempotent
//! (at-least-once overall).

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::mysql::MySqlRow;
use sqlx::Row;

use crate::error::{Result, SyncError};
use crate::record::TableSpec;

/// Row-level change kind captured by a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOp {
    Insert,
    Update,
    Delete,
}

impl QueueOp {
    /// Parse from the queue table's ENUM value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "insert" => Some(QueueOp::Insert),
            "update" => Some(QueueOp::Update),
            "delete" => Some(QueueOp::Delete),
            _ => None,
        }
    }

    /// The ENUM value stored in the queue table.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOp::Insert => "insert",
            QueueOp::Update => "update",
            QueueOp::Delete => "delete",
        }
    }
}

impl std::fmt::Display for QueueOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a running drain.
    Processing,
    /// Retry budget exhausted; left for manual remediation.
    Failed,
}

impl QueueStatus {
    /// Parse from the queue table's ENUM value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    /// The ENUM value stored in the queue table.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending change notification, as captured by a trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Queue row id (AUTO_INCREMENT).
    pub id: u64,
    /// Source table the change happened on.
    pub table_name: String,
    /// Primary key of the changed row.
    pub record_id: i64,
    /// What kind of change the trigger observed.
    pub operation: QueueOp,
    /// JSON snapshot of the old row, delete triggers only.
    /// Diagnostic; the apply path re-reads current state instead.
    pub old_data: Option<String>,
    /// When the trigger fired.
    pub created_at: NaiveDateTime,
    /// Failed apply attempts so far.
    pub attempts: u32,
    /// When the last failed attempt happened.
    pub last_attempt: Option<NaiveDateTime>,
    /// Current lifecycle state.
    pub status: QueueStatus,
}

impl QueueEntry {
    /// Build a fresh pending entry, the shape a trigger would insert.
    pub fn new(
        id: u64,
        table_name: impl Into<String>,
        record_id: i64,
        operation: QueueOp,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            id,
            table_name: table_name.into(),
            record_id,
            operation,
            old_data: None,
            created_at,
            attempts: 0,
            last_attempt: None,
            status: QueueStatus::Pending,
        }
    }

    /// Status this entry moves to after one more failed attempt.
    ///
    /// `retry_limit` is the total number of attempts an entry gets
    /// before it is parked as `failed`.
    pub fn status_after_failure(&self, retry_limit: u32) -> QueueStatus {
        if self.attempts + 1 >= retry_limit {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        }
    }
}

// =============================================================================
// Statement text
// =============================================================================
//
// Table names are registry-driven identifiers validated by
// `TableSpec::validate`, so they are interpolated; every value goes
// through a bind parameter.

/// Columns selected for every entry read, in decode order.
const ENTRY_COLUMNS: &str =
    "id, table_name, record_id, operation, old_data, created_at, attempts, last_attempt, status";

/// Claim the oldest pending entries, skipping rows held by concurrent
/// drains. Entries stuck in `processing` longer than the reclaim
/// threshold (a crashed invocation) are claimable again.
/// Binds: reclaim threshold in seconds, LIMIT.
pub fn claim_sql(spec: &TableSpec) -> String {
    format!(
        "SELECT {ENTRY_COLUMNS} FROM {queue} \
         WHERE status = 'pending' \
            OR (status = 'processing' \
                AND (last_attempt IS NULL \
                     OR last_attempt < NOW() - INTERVAL ? SECOND)) \
         ORDER BY created_at ASC, id ASC \
         LIMIT ? \
         FOR UPDATE SKIP LOCKED",
        queue = spec.queue_table,
    )
}

/// Mark a claimed batch as processing, stamping the claim time.
/// Binds: `n` entry ids.
pub fn mark_processing_sql(spec: &TableSpec, n: usize) -> String {
    format!(
        "UPDATE {queue} \
         SET status = 'processing', last_attempt = CURRENT_TIMESTAMP \
         WHERE id IN ({placeholders})",
        queue = spec.queue_table,
        placeholders = placeholders(n),
    )
}

/// Return unprocessed claims to `pending` when a batch aborts early.
/// Only `processing` rows move; an entry failed in the meantime stays
/// failed. Binds: `n` entry ids.
pub fn release_sql(spec: &TableSpec, n: usize) -> String {
    format!(
        "UPDATE {queue} SET status = 'pending' \
         WHERE id IN ({placeholders}) AND status = 'processing'",
        queue = spec.queue_table,
        placeholders = placeholders(n),
    )
}

/// Remove an entry after a successful apply. Binds: entry id.
pub fn ack_sql(spec: &TableSpec) -> String {
    format!("DELETE FROM {queue} WHERE id = ?", queue = spec.queue_table)
}

/// Record a failed attempt. Binds: next status, entry id.
pub fn fail_sql(spec: &TableSpec) -> String {
    format!(
        "UPDATE {queue} \
         SET attempts = attempts + 1, last_attempt = CURRENT_TIMESTAMP, status = ? \
         WHERE id = ?",
        queue = spec.queue_table,
    )
}

/// Per-status entry counts for depth reporting. No binds.
pub fn depth_sql(spec: &TableSpec) -> String {
    format!(
        "SELECT status, COUNT(*) AS n FROM {queue} GROUP BY status",
        queue = spec.queue_table,
    )
}

/// Per-status totals for one queue table on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

impl QueueDepth {
    /// All entries still sitting in the queue.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.failed
    }

    /// Check if the queue has fully drained.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n.saturating_mul(3));
    for i in 0..n {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

/// Decode one queue row into a [`QueueEntry`].
///
/// The queue columns are signed `INT` on the wire, so ids and attempt
/// counts decode as signed and convert.
pub fn decode_entry(row: &MySqlRow) -> Result<QueueEntry> {
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    Ok(QueueEntry {
        id: row.try_get::<i64, _>("id")?.max(0) as u64,
        table_name: row.try_get("table_name")?,
        record_id: row.try_get::<i64, _>("record_id")?,
        operation: QueueOp::from_str(&operation)
            .ok_or_else(|| SyncError::Internal(format!("unknown queue operation `{operation}`")))?,
        old_data: row.try_get("old_data")?,
        created_at: row.try_get("created_at")?,
        attempts: row.try_get::<i64, _>("attempts")?.max(0) as u32,
        last_attempt: row.try_get("last_attempt")?,
        status: QueueStatus::from_str(&status)
            .ok_or_else(|| SyncError::Internal(format!("unknown queue status `{status}`")))?,
    })
}
