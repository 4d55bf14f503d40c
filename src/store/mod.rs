// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node store trait.
//!
//! Defines the interface the engine drains and applies through. One
//! store represents one node (local or remote); every operation is
//! scoped by a [`TableSpec`] from the registry. Two implementations
//! ship with the crate:
//!
//! - [`MySqlNode`](mysql::MySqlNode): the production store backed by a
//!   MySQL pool, with real triggers doing the capture.
//! - [`MemoryNode`](memory::MemoryNode): an in-process store with
//!   emulated capture, for tests and standalone experiments.
//!
//! The trait allows testing the drain/apply/fallback logic without a
//! database and decouples the engine from connection handling.
//!
//! # Example
//!
//! ```rust
//! use duplex_sync::record::{SqlValue, TableSpec};
//! use duplex_sync::store::{memory::MemoryNode, SyncStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = TableSpec::new("guests", "id");
//! let node = MemoryNode::new("local", &[spec.clone()]);
//!
//! // A user-originated write is captured into the queue...
//! node.user_insert(&spec, [("id", SqlValue::Int(1))]);
//! assert_eq!(node.queue_depth(&spec).await?.pending, 1);
//!
//! // ...an engine-originated write is not.
//! let row = node.fetch_row(&spec, 1).await?.unwrap();
//! node.replace_row(&spec, row).await?;
//! assert_eq!(node.queue_depth(&spec).await?.pending, 1);
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod mysql;

use chrono::NaiveDateTime;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::queue::{QueueDepth, QueueEntry, QueueStatus};
use crate::record::{Record, TableSpec};

pub use memory::MemoryNode;
pub use mysql::MySqlNode;

/// Type alias for boxed store futures (reduces trait signature noise).
pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// What the destination knows about a row's watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkProbe {
    /// No row with that key exists.
    Missing,
    /// The row exists but its watermark column is NULL.
    Unstamped,
    /// The row exists with this watermark.
    At(NaiveDateTime),
}

impl WatermarkProbe {
    /// Decide whether a source row stamped `source_ts` should overwrite
    /// the probed destination state. Missing and unstamped rows always
    /// lose; equal stamps are left alone so repeated fallback runs are
    /// stable.
    pub fn is_stale_against(&self, source_ts: NaiveDateTime) -> bool {
        match self {
            WatermarkProbe::Missing | WatermarkProbe::Unstamped => true,
            WatermarkProbe::At(dest_ts) => *dest_ts < source_ts,
        }
    }
}

/// One node's storage, as the engine sees it.
///
/// Methods return boxed futures so the trait stays object-safe and
/// implementations can clone what they need before going async.
/// Implementations must uphold two contracts:
///
/// 1. `replace_row` and `delete_row` are engine-originated writes and
///    must not produce queue entries (suppression).
/// 2. `claim_batch` must never hand the same entry to two live drains
///    (atomic claim).
pub trait SyncStore: Send + Sync + 'static {
    /// Node label for logs and reports ("local" / "remote").
    fn label(&self) -> &str;

    /// Claim up to `limit` oldest pending entries for `spec`'s table and
    /// mark them `processing`. Also reclaims entries stuck in
    /// `processing` past the store's reclaim threshold.
    fn claim_batch(&self, spec: &TableSpec, limit: u32) -> StoreFuture<'_, Vec<QueueEntry>>;

    /// Return claimed-but-unprocessed entries to `pending` (batch abort).
    fn release_claims(&self, spec: &TableSpec, entry_ids: Vec<u64>) -> StoreFuture<'_, ()>;

    /// Remove an entry after a successful apply.
    fn ack_entry(&self, spec: &TableSpec, entry_id: u64) -> StoreFuture<'_, ()>;

    /// Record a failed attempt and move the entry to `next` status.
    fn fail_entry(
        &self,
        spec: &TableSpec,
        entry_id: u64,
        next: QueueStatus,
    ) -> StoreFuture<'_, ()>;

    /// Read the current row by primary key, or `None` if it vanished.
    fn fetch_row(&self, spec: &TableSpec, record_id: i64) -> StoreFuture<'_, Option<Record>>;

    /// Replace-style upsert under suppression: delete any row with the
    /// record's key, insert the record verbatim. Atomic per row.
    fn replace_row(&self, spec: &TableSpec, record: Record) -> StoreFuture<'_, ()>;

    /// Delete by primary key under suppression. Returns whether a row
    /// was actually removed (`false` is a no-op, not an error).
    fn delete_row(&self, spec: &TableSpec, record_id: i64) -> StoreFuture<'_, bool>;

    /// (id, watermark) for rows with watermark ≥ `since`, oldest first,
    /// capped at `limit`. Fallback source scan.
    fn scan_watermarks(
        &self,
        spec: &TableSpec,
        since: NaiveDateTime,
        limit: u32,
    ) -> StoreFuture<'_, Vec<(i64, NaiveDateTime)>>;

    /// What this node knows about one row's watermark. Fallback
    /// destination compare.
    fn probe_watermark(&self, spec: &TableSpec, record_id: i64)
        -> StoreFuture<'_, WatermarkProbe>;

    /// Check the table actually has the configured watermark column.
    fn has_watermark_column(&self, spec: &TableSpec) -> StoreFuture<'_, bool>;

    /// Check the queue table exists on this node.
    fn has_queue_table(&self, spec: &TableSpec) -> StoreFuture<'_, bool>;

    /// Check all three capture triggers exist on this node.
    fn has_capture_triggers(&self, spec: &TableSpec) -> StoreFuture<'_, bool>;

    /// Per-status queue totals for depth reporting.
    fn queue_depth(&self, spec: &TableSpec) -> StoreFuture<'_, QueueDepth>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_probe_missing_is_stale() {
        assert!(WatermarkProbe::Missing.is_stale_against(ts(10, 0)));
    }

    #[test]
    fn test_probe_unstamped_is_stale() {
        assert!(WatermarkProbe::Unstamped.is_stale_against(ts(10, 0)));
    }

    #[test]
    fn test_probe_older_is_stale() {
        assert!(WatermarkProbe::At(ts(9, 0)).is_stale_against(ts(10, 0)));
    }

    #[test]
    fn test_probe_equal_is_not_stale() {
        assert!(!WatermarkProbe::At(ts(10, 0)).is_stale_against(ts(10, 0)));
    }

    #[test]
    fn test_probe_newer_is_not_stale() {
        assert!(!WatermarkProbe::At(ts(11, 0)).is_stale_against(ts(10, 0)));
    }
}
