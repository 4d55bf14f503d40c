// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The sync engine: bidirectional queue drain plus timestamp fallback.
//!
//! One [`SyncEngine`] owns both node stores and the table registry. It
//! runs no background tasks; every entry point executes one bounded
//! pass in the caller's task and returns a [`SyncReport`], so cadence
//! is the caller's concern (a request handler, a cron tick, a test).
//!
//! # One `sync()` pass
//!
//! ```text
//!            local → remote                 remote → local
//!   ┌──────────────────────────┐   ┌──────────────────────────┐
//!   │ claim batch (local queue)│   │ claim batch (remote queue)│
//!   │ coalesce per record      │   │ coalesce per record       │
//!   │ re-read local rows       │   │ re-read remote rows       │
//!   │ apply on remote,         │   │ apply on local,           │
//!   │   suppressed             │   │   suppressed              │
//!   │ ack / requeue / fail     │   │ ack / requeue / fail      │
//!   └──────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! The two directions are independent passes within the invocation;
//! a failure in one never blocks the other.
//!
//! # Example
//!
//! ```
//! use duplex_sync::{MemoryNode, SqlValue, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> duplex_sync::Result<()> {
//! let config = SyncConfig::for_testing("mysql://unused", "mysql://unused", &["guests"]);
//! let specs = config.table_specs()?;
//! let local = Arc::new(MemoryNode::new("local", &specs));
//! let remote = Arc::new(MemoryNode::new("remote", &specs));
//! local.user_insert(
//!     &specs[0],
//!     [("id", SqlValue::Int(42)), ("remark", SqlValue::Text("X".into()))],
//! );
//!
//! let engine = SyncEngine::with_stores(config, local, remote.clone())?;
//! let report = engine.sync("example").await;
//! assert!(report.success);
//! assert!(remote.row(&specs[0], 42).is_some());
//! # Ok(())
//! # }
//! ```

mod drain;
mod fallback;
mod types;

pub use types::{
    Direction, DirectionReport, QueueStatusReport, SyncReport, TableQueueStatus, TableReport,
};

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::record::TableSpec;
use crate::store::{MySqlNode, SyncStore};

/// Bidirectional synchronization engine over two node stores.
pub struct SyncEngine<S: SyncStore = MySqlNode> {
    local: Arc<S>,
    remote: Arc<S>,
    specs: Vec<TableSpec>,
    config: SyncConfig,
}

impl SyncEngine<MySqlNode> {
    /// Build an engine over two MySQL nodes from configuration.
    ///
    /// Nothing connects yet; pools open lazily on the first operation
    /// (or eagerly via [`connect`](Self::connect)).
    pub fn new(config: SyncConfig) -> Result<Self> {
        let retry = config.connect.retry_config();
        let reclaim = config.drain.reclaim_after_duration();
        let local = MySqlNode::new("local", config.local.clone())
            .with_retry(retry.clone())
            .with_reclaim_after(reclaim);
        let remote = MySqlNode::new("remote", config.remote.clone())
            .with_retry(retry)
            .with_reclaim_after(reclaim);
        Self::with_stores(config, Arc::new(local), Arc::new(remote))
    }

    /// Eagerly connect both pools.
    pub async fn connect(&self) -> Result<()> {
        self.local.connect().await?;
        self.remote.connect().await?;
        Ok(())
    }

    /// Close both pools and drop their connections.
    pub async fn close(&self) {
        self.local.close().await;
        self.remote.close().await;
    }
}

impl<S: SyncStore> SyncEngine<S> {
    /// Build an engine over caller-provided stores. Used by tests with
    /// [`MemoryNode`](crate::store::MemoryNode) and by embedders that
    /// manage their own node objects.
    pub fn with_stores(config: SyncConfig, local: Arc<S>, remote: Arc<S>) -> Result<Self> {
        let specs = config.table_specs()?;
        Ok(Self {
            local,
            remote,
            specs,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Participating tables, as validated at construction.
    pub fn tables(&self) -> &[TableSpec] {
        &self.specs
    }

    pub fn local(&self) -> &Arc<S> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<S> {
        &self.remote
    }

    fn endpoints(&self, direction: Direction) -> (&S, &S) {
        match direction {
            Direction::LocalToRemote => (self.local.as_ref(), self.remote.as_ref()),
            Direction::RemoteToLocal => (self.remote.as_ref(), self.local.as_ref()),
        }
    }

    /// Drain both queues, local to remote first, then remote to local.
    ///
    /// `origin` labels who triggered the pass (a request id, a job
    /// name) and lands in logs and the report. Failures never raise:
    /// they are absorbed into the report so a scheduled caller always
    /// gets the full per-table picture.
    pub async fn sync(&self, origin: &str) -> SyncReport {
        let started = Instant::now();
        let deadline = self
            .config
            .drain
            .time_budget_duration()
            .map(|budget| started + budget);
        info!(origin, "Starting sync pass");

        let mut report = SyncReport::new(origin);
        for direction in Direction::BOTH {
            let (source, destination) = self.endpoints(direction);
            let direction_report = drain::drain_direction(
                source,
                destination,
                direction,
                &self.specs,
                &self.config.drain,
                deadline,
            )
            .await;
            match direction {
                Direction::LocalToRemote => report.local_to_remote = direction_report,
                Direction::RemoteToLocal => report.remote_to_local = direction_report,
            }
        }

        let elapsed = started.elapsed();
        report.finalize(elapsed.as_millis() as u64);
        metrics::record_sync_duration("drain", elapsed);
        if report.success {
            info!(
                origin,
                applied = report.total_applied(),
                elapsed_ms = report.elapsed_ms,
                "Sync pass complete"
            );
        } else {
            warn!(
                origin,
                applied = report.total_applied(),
                failed = report.failed,
                elapsed_ms = report.elapsed_ms,
                "Sync pass completed with failures"
            );
        }
        report
    }

    /// Reconcile one table by timestamp over the given window (hours),
    /// both directions. `None` uses the configured default window.
    ///
    /// Fails fast when `table` is not configured; a missing watermark
    /// column surfaces per table inside the report instead.
    pub async fn force_sync_latest(
        &self,
        window_hours: Option<u32>,
        table: &str,
    ) -> Result<SyncReport> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == table)
            .cloned()
            .ok_or_else(|| SyncError::Config(format!("`{table}` is not a configured table")))?;
        Ok(self
            .fallback_pass(window_hours, std::slice::from_ref(&spec))
            .await)
    }

    /// Reconcile every configured table by timestamp.
    pub async fn force_sync_all(&self, window_hours: Option<u32>) -> SyncReport {
        self.fallback_pass(window_hours, &self.specs).await
    }

    async fn fallback_pass(&self, window_hours: Option<u32>, specs: &[TableSpec]) -> SyncReport {
        let started = Instant::now();
        let window_hours = window_hours.unwrap_or(self.config.fallback.default_window_hours);
        let since = Utc::now().naive_utc() - chrono::Duration::hours(i64::from(window_hours));
        info!(window_hours, tables = specs.len(), "Starting fallback pass");

        let mut report = SyncReport::new("fallback");
        for direction in Direction::BOTH {
            let (source, destination) = self.endpoints(direction);
            let mut direction_report = DirectionReport::default();
            for spec in specs {
                direction_report.absorb(
                    fallback::fallback_table(
                        source,
                        destination,
                        direction,
                        spec,
                        since,
                        self.config.fallback.scan_limit,
                    )
                    .await,
                );
            }
            match direction {
                Direction::LocalToRemote => report.local_to_remote = direction_report,
                Direction::RemoteToLocal => report.remote_to_local = direction_report,
            }
        }

        let elapsed = started.elapsed();
        report.finalize(elapsed.as_millis() as u64);
        metrics::record_sync_duration("fallback", elapsed);
        info!(
            applied = report.total_applied(),
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "Fallback pass complete"
        );
        report
    }

    /// Verify every participating table has its queue table and all
    /// three capture triggers on both nodes.
    ///
    /// Returns `Ok(false)` with a warning per gap; errors only when a
    /// node cannot be asked at all.
    pub async fn check_queue_tables(&self) -> Result<bool> {
        let mut all_present = true;
        for node in [self.local.as_ref(), self.remote.as_ref()] {
            for spec in &self.specs {
                if !node.has_queue_table(spec).await? {
                    warn!(
                        node = node.label(),
                        queue = %spec.queue_table,
                        "Queue table missing"
                    );
                    all_present = false;
                }
                if !node.has_capture_triggers(spec).await? {
                    warn!(
                        node = node.label(),
                        table = %spec.name,
                        "Capture triggers missing"
                    );
                    all_present = false;
                }
            }
        }
        Ok(all_present)
    }

    /// Snapshot queue depths for every table on both nodes, updating
    /// the depth gauges as a side effect.
    pub async fn queue_status(&self) -> Result<QueueStatusReport> {
        let mut status = QueueStatusReport::default();
        for spec in &self.specs {
            let local = self.local.queue_depth(spec).await?;
            let remote = self.remote.queue_depth(spec).await?;
            for (node, depth) in [(self.local.label(), local), (self.remote.label(), remote)] {
                metrics::set_queue_depth(node, &spec.name, "pending", depth.pending);
                metrics::set_queue_depth(node, &spec.name, "processing", depth.processing);
                metrics::set_queue_depth(node, &spec.name, "failed", depth.failed);
            }
            status.tables.push(TableQueueStatus {
                table: spec.name.clone(),
                local,
                remote,
            });
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SqlValue;
    use crate::store::MemoryNode;

    fn engine_with(tables: &[&str]) -> (SyncEngine<MemoryNode>, Arc<MemoryNode>, Arc<MemoryNode>) {
        let config = SyncConfig::for_testing("mysql://unused", "mysql://unused", tables);
        let specs = config.table_specs().unwrap();
        let local = Arc::new(MemoryNode::new("local", &specs));
        let remote = Arc::new(MemoryNode::new("remote", &specs));
        let engine = SyncEngine::with_stores(config, local.clone(), remote.clone()).unwrap();
        (engine, local, remote)
    }

    #[tokio::test]
    async fn test_round_trip_update_then_delete() {
        let (engine, local, remote) = engine_with(&["guests"]);
        let spec = engine.tables()[0].clone();

        local.user_insert(
            &spec,
            [("id", SqlValue::Int(42)), ("remark", SqlValue::Text("draft".into()))],
        );
        let report = engine.sync("seed").await;
        assert!(report.success);
        let row = remote.row(&spec, 42).expect("insert propagated");
        assert_eq!(row.get("remark"), Some(&SqlValue::Text("draft".into())));

        local.user_update(&spec, 42, [("remark", SqlValue::Text("X".into()))]);
        let report = engine.sync("request").await;
        assert!(report.success);
        assert!(local.queue_entries(&spec).is_empty());
        let row = remote.row(&spec, 42).expect("update propagated");
        assert_eq!(row.get("remark"), Some(&SqlValue::Text("X".into())));

        remote.user_delete(&spec, 42);
        let report = engine.sync("request").await;
        assert!(report.success);
        assert!(local.row(&spec, 42).is_none());
        assert!(remote.queue_entries(&spec).is_empty());
    }

    #[tokio::test]
    async fn test_both_directions_in_one_pass() {
        let (engine, local, remote) = engine_with(&["guests"]);
        let spec = engine.tables()[0].clone();

        local.user_insert(&spec, [("id", SqlValue::Int(1))]);
        remote.user_insert(&spec, [("id", SqlValue::Int(2))]);
        let report = engine.sync("tick").await;

        assert!(report.success);
        assert_eq!(report.local_to_remote.applied, 1);
        assert_eq!(report.remote_to_local.applied, 1);
        assert!(remote.row(&spec, 1).is_some());
        assert!(local.row(&spec, 2).is_some());
    }

    #[tokio::test]
    async fn test_repeated_sync_converges() {
        let (engine, local, remote) = engine_with(&["guests", "reservations"]);
        let guests = engine.tables()[0].clone();
        let reservations = engine.tables()[1].clone();

        local.user_insert(&guests, [("id", SqlValue::Int(1))]);
        local.user_insert(&reservations, [("id", SqlValue::Int(10))]);
        remote.user_insert(&guests, [("id", SqlValue::Int(2))]);

        engine.sync("first").await;
        let report = engine.sync("second").await;

        assert!(report.success);
        assert_eq!(report.local_to_remote.tables[0].claimed, 0);
        assert_eq!(local.table_rows(&guests), remote.table_rows(&guests));
        assert_eq!(local.table_rows(&reservations), remote.table_rows(&reservations));
        let status = engine.queue_status().await.unwrap();
        assert_eq!(status.total_pending(), 0);
    }

    #[tokio::test]
    async fn test_offline_node_flips_success() {
        let (engine, local, remote) = engine_with(&["guests"]);
        let spec = engine.tables()[0].clone();
        local.user_insert(&spec, [("id", SqlValue::Int(7))]);
        remote.set_offline(true);

        let report = engine.sync("request").await;

        assert!(!report.success);
        assert!(report.local_to_remote.tables[0].aborted);
        // The write survives for the next pass.
        remote.set_offline(false);
        let report = engine.sync("request").await;
        assert!(report.success);
        assert!(remote.row(&spec, 7).is_some());
    }

    #[tokio::test]
    async fn test_force_sync_latest_reconciles_untracked_writes() {
        let (engine, local, remote) = engine_with(&["guests"]);
        let spec = engine.tables()[0].clone();
        let stamp = chrono::Utc::now().naive_utc();

        // Triggers disabled: the queue never hears about this row.
        local.set_triggers_installed(false);
        local.user_insert(
            &spec,
            [
                ("id".to_string(), SqlValue::Int(5)),
                ("sync_timestamp".to_string(), SqlValue::DateTime(stamp)),
            ],
        );

        let report = engine.force_sync_latest(Some(24), "guests").await.unwrap();
        assert!(report.success);
        assert_eq!(report.local_to_remote.applied, 1);
        assert!(remote.row(&spec, 5).is_some());

        // Nothing left to do on a second pass.
        let report = engine.force_sync_latest(Some(24), "guests").await.unwrap();
        assert_eq!(report.local_to_remote.applied, 0);
    }

    #[tokio::test]
    async fn test_force_sync_latest_rejects_unknown_table() {
        let (engine, _, _) = engine_with(&["guests"]);
        let err = engine.force_sync_latest(None, "rooms").await.unwrap_err();
        assert!(err.to_string().contains("rooms"));
    }

    #[tokio::test]
    async fn test_check_queue_tables() {
        let (engine, local, _) = engine_with(&["guests"]);
        assert!(engine.check_queue_tables().await.unwrap());

        local.set_triggers_installed(false);
        assert!(!engine.check_queue_tables().await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_status_counts_both_nodes() {
        let (engine, local, remote) = engine_with(&["guests"]);
        let spec = engine.tables()[0].clone();
        local.user_insert(&spec, [("id", SqlValue::Int(1))]);
        local.user_insert(&spec, [("id", SqlValue::Int(2))]);
        remote.user_insert(&spec, [("id", SqlValue::Int(3))]);

        let status = engine.queue_status().await.unwrap();
        assert_eq!(status.tables.len(), 1);
        assert_eq!(status.tables[0].local.pending, 2);
        assert_eq!(status.tables[0].remote.pending, 1);
        assert_eq!(status.total_pending(), 3);
    }
}
