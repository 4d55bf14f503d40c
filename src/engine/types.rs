//! Sync pass reports.
//!
//! Every engine entry point returns a [`SyncReport`]: per-direction,
//! per-table counters plus an overall verdict. Reports serialize to
//! JSON so callers can expose them on status endpoints verbatim.

use serde::Serialize;

use crate::queue::QueueDepth;

/// One replication direction within a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    /// Both directions, in the order one pass runs them.
    pub const BOTH: [Direction; 2] = [Direction::LocalToRemote, Direction::RemoteToLocal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LocalToRemote => "local_to_remote",
            Direction::RemoteToLocal => "remote_to_local",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one table in one direction.
///
/// The drain path fills `claimed`; the fallback path fills `examined`.
/// A batch cut short by a connectivity failure or the time budget sets
/// `aborted` and usually `error`; entries applied before the cut stay
/// applied.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableReport {
    pub table: String,
    /// Queue entries claimed this pass.
    pub claimed: u64,
    /// Rows examined by a fallback scan.
    pub examined: u64,
    /// Rows written to the destination (insert/update).
    pub applied: u64,
    /// Rows deleted on the destination.
    pub deleted: u64,
    /// Claimed entries coalesced away as duplicates of a newer entry.
    pub skipped: u64,
    /// Entries returned to `pending` for a later attempt.
    pub requeued: u64,
    /// Entries whose retry budget ran out, or fallback rows that failed.
    pub failed: u64,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Mark this table's batch aborted with the failure that cut it short.
    pub(crate) fn abort(&mut self, error: impl ToString) {
        self.aborted = true;
        self.error = Some(error.to_string());
    }
}

/// Aggregated counters for one direction of a sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectionReport {
    pub applied: u64,
    pub deleted: u64,
    pub failed: u64,
    pub tables: Vec<TableReport>,
}

impl DirectionReport {
    /// Fold one table's counters into the direction totals.
    pub(crate) fn absorb(&mut self, table: TableReport) {
        self.applied += table.applied;
        self.deleted += table.deleted;
        self.failed += table.failed;
        self.tables.push(table);
    }

    /// True when no table failed, aborted, or errored.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.tables.iter().all(|t| !t.aborted && t.error.is_none())
    }
}

/// Outcome of one engine invocation (`sync` or a fallback pass).
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Caller-supplied label for who triggered this pass.
    pub origin: String,
    /// True when both directions completed with nothing failed.
    pub success: bool,
    pub local_to_remote: DirectionReport,
    pub remote_to_local: DirectionReport,
    /// Total failed entries across both directions.
    pub failed: u64,
    pub elapsed_ms: u64,
}

impl SyncReport {
    pub(crate) fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            success: false,
            local_to_remote: DirectionReport::default(),
            remote_to_local: DirectionReport::default(),
            failed: 0,
            elapsed_ms: 0,
        }
    }

    /// Fill the aggregate fields once both directions are in.
    pub(crate) fn finalize(&mut self, elapsed_ms: u64) {
        self.failed = self.local_to_remote.failed + self.remote_to_local.failed;
        self.success = self.local_to_remote.is_clean() && self.remote_to_local.is_clean();
        self.elapsed_ms = elapsed_ms;
    }

    /// Rows written or deleted on either node.
    pub fn total_applied(&self) -> u64 {
        self.local_to_remote.applied
            + self.local_to_remote.deleted
            + self.remote_to_local.applied
            + self.remote_to_local.deleted
    }
}

/// Queue depths for one table on both nodes.
#[derive(Debug, Clone, Serialize)]
pub struct TableQueueStatus {
    pub table: String,
    pub local: QueueDepth,
    pub remote: QueueDepth,
}

/// Snapshot of every configured queue, both nodes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatusReport {
    pub tables: Vec<TableQueueStatus>,
}

impl QueueStatusReport {
    /// Entries still waiting to be drained, either node.
    pub fn total_pending(&self) -> u64 {
        self.tables
            .iter()
            .map(|t| t.local.pending + t.remote.pending)
            .sum()
    }

    /// Entries parked as failed, either node.
    pub fn total_failed(&self) -> u64 {
        self.tables
            .iter()
            .map(|t| t.local.failed + t.remote.failed)
            .sum()
    }
}
