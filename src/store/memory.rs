//! In-process node store with emulated trigger capture.
//!
//! [`MemoryNode`] behaves like one MySQL node as the engine sees it:
//! user-originated writes ([`user_insert`](MemoryNode::user_insert),
//! [`user_update`](MemoryNode::user_update),
//! [`user_delete`](MemoryNode::user_delete)) enqueue change
//! notifications exactly like the capture triggers would, while
//! engine-originated writes through [`SyncStore`] never do. Fault
//! injection hooks simulate node outages, per-table connectivity loss,
//! and destination write rejections.
//!
//! Used by the engine's unit tests, the chaos tests, and standalone
//! experiments that don't want a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{NaiveDateTime, Utc};

use crate::error::{Result, SyncError};
use crate::queue::{QueueDepth, QueueEntry, QueueOp, QueueStatus};
use crate::record::{Record, SqlValue, TableSpec};
use crate::store::{StoreFuture, SyncStore, WatermarkProbe};

#[derive(Default)]
struct Inner {
    /// Table name → rows by primary key.
    tables: HashMap<String, BTreeMap<i64, Record>>,
    /// Queue table name → entries.
    queues: HashMap<String, Vec<QueueEntry>>,
    /// Tables currently refusing all operations.
    poisoned: HashSet<String>,
}

/// One emulated node: tables, queues, and capture behavior.
pub struct MemoryNode {
    label: String,
    inner: Mutex<Inner>,
    next_entry_id: AtomicU64,
    /// Emulates a user session that has the sentinel set.
    suppressed: AtomicBool,
    /// Emulates the whole node being unreachable.
    offline: AtomicBool,
    /// Emulates dropped capture triggers.
    triggers_installed: AtomicBool,
    /// Engine writes fail once this many have succeeded.
    fail_writes_after: AtomicUsize,
    write_count: AtomicUsize,
}

impl MemoryNode {
    /// Create a node with empty tables and queues for each spec.
    pub fn new(label: impl Into<String>, specs: &[TableSpec]) -> Self {
        let mut inner = Inner::default();
        for spec in specs {
            inner.tables.insert(spec.name.clone(), BTreeMap::new());
            inner.queues.insert(spec.queue_table.clone(), Vec::new());
        }
        Self {
            label: label.into(),
            inner: Mutex::new(inner),
            next_entry_id: AtomicU64::new(1),
            suppressed: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            triggers_installed: AtomicBool::new(true),
            fail_writes_after: AtomicUsize::new(usize::MAX),
            write_count: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // User-originated writes (capture emulation)
    // =========================================================================

    /// Insert a row the way an application would.
    ///
    /// Captures one `insert` entry unless suppression is active or the
    /// triggers are "dropped".
    ///
    /// # Panics
    ///
    /// Panics if the columns don't include an integer primary key, or
    /// the table isn't registered. These are harness misuse, not
    /// runtime conditions.
    pub fn user_insert<S, I>(&self, spec: &TableSpec, columns: I)
    where
        S: Into<String>,
        I: IntoIterator<Item = (S, SqlValue)>,
    {
        let record: Record = columns
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect();
        let id = record
            .id(&spec.primary_key)
            .expect("user_insert requires an integer primary key");
        let mut inner = self.inner.lock().unwrap();
        inner
            .tables
            .get_mut(&spec.name)
            .expect("table not registered")
            .insert(id, record);
        drop(inner);
        self.capture(spec, id, QueueOp::Insert, None);
    }

    /// Update columns on an existing row the way an application would.
    ///
    /// # Panics
    ///
    /// Panics if the row doesn't exist or the table isn't registered.
    pub fn user_update<S, I>(&self, spec: &TableSpec, id: i64, columns: I)
    where
        S: Into<String>,
        I: IntoIterator<Item = (S, SqlValue)>,
    {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .tables
            .get_mut(&spec.name)
            .expect("table not registered")
            .get_mut(&id)
            .expect("user_update requires an existing row");
        for (k, v) in columns {
            row.set(k.into(), v);
        }
        drop(inner);
        self.capture(spec, id, QueueOp::Update, None);
    }

    /// Delete a row the way an application would. Returns whether the
    /// row existed. The captured entry carries the old row as JSON,
    /// matching what the delete trigger snapshots.
    pub fn user_delete(&self, spec: &TableSpec, id: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner
            .tables
            .get_mut(&spec.name)
            .expect("table not registered")
            .remove(&id);
        drop(inner);
        match removed {
            Some(old) => {
                self.capture(spec, id, QueueOp::Delete, Some(old.to_json_string()));
                true
            }
            None => false,
        }
    }

    fn capture(&self, spec: &TableSpec, id: i64, op: QueueOp, old_data: Option<String>) {
        if self.suppressed.load(Ordering::SeqCst) || !self.triggers_installed.load(Ordering::SeqCst)
        {
            return;
        }
        let entry_id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let mut entry = QueueEntry::new(entry_id, &spec.name, id, op, Utc::now().naive_utc());
        entry.old_data = old_data;
        let mut inner = self.inner.lock().unwrap();
        inner
            .queues
            .get_mut(&spec.queue_table)
            .expect("queue not registered")
            .push(entry);
    }

    // =========================================================================
    // Fault injection and inspection
    // =========================================================================

    /// Emulate a session holding the suppression sentinel: subsequent
    /// user writes stop producing entries until cleared.
    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::SeqCst);
    }

    /// Emulate the node dropping off the network: every store operation
    /// fails with a connectivity error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Emulate dropped capture triggers (bulk-import scenario).
    pub fn set_triggers_installed(&self, installed: bool) {
        self.triggers_installed.store(installed, Ordering::SeqCst);
    }

    /// Emulate a single table's queue becoming unreachable while the
    /// rest of the node stays healthy.
    pub fn poison_table(&self, table: &str) {
        self.inner
            .lock()
            .unwrap()
            .poisoned
            .insert(table.to_string());
    }

    /// Clear a poisoned table.
    pub fn heal_table(&self, table: &str) {
        self.inner.lock().unwrap().poisoned.remove(table);
    }

    /// Engine-originated writes fail after `n` more successes.
    pub fn fail_writes_after(&self, n: usize) {
        self.write_count.store(0, Ordering::SeqCst);
        self.fail_writes_after.store(n, Ordering::SeqCst);
    }

    /// Current rows of a table, for equality assertions.
    pub fn table_rows(&self, spec: &TableSpec) -> BTreeMap<i64, Record> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(&spec.name)
            .cloned()
            .unwrap_or_default()
    }

    /// One row, synchronously.
    pub fn row(&self, spec: &TableSpec, id: i64) -> Option<Record> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(&spec.name)
            .and_then(|t| t.get(&id))
            .cloned()
    }

    /// Queue contents, for assertions.
    pub fn queue_entries(&self, spec: &TableSpec) -> Vec<QueueEntry> {
        self.inner
            .lock()
            .unwrap()
            .queues
            .get(&spec.queue_table)
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Shared checks
    // =========================================================================

    fn check_reachable(&self, table: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::connectivity_msg(&self.label, "node offline"));
        }
        if self.inner.lock().unwrap().poisoned.contains(table) {
            return Err(SyncError::connectivity_msg(
                &self.label,
                format!("table `{table}` unreachable"),
            ));
        }
        Ok(())
    }

    fn check_write_budget(&self, table: &str, record_id: i64) -> Result<()> {
        let count = self.write_count.fetch_add(1, Ordering::SeqCst);
        if count >= self.fail_writes_after.load(Ordering::SeqCst) {
            return Err(SyncError::Apply {
                table: table.to_string(),
                record_id,
                message: "simulated write failure".to_string(),
            });
        }
        Ok(())
    }
}

impl SyncStore for MemoryNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn claim_batch(&self, spec: &TableSpec, limit: u32) -> StoreFuture<'_, Vec<QueueEntry>> {
        let out = self.check_reachable(&spec.name).and_then(|()| {
            let mut inner = self.inner.lock().unwrap();
            let queue = inner.queues.get_mut(&spec.queue_table).ok_or_else(|| {
                SyncError::QueueTableMissing {
                    node: self.label.clone(),
                    queue_table: spec.queue_table.clone(),
                }
            })?;
            let mut claimable: Vec<usize> = queue
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status == QueueStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            claimable.sort_by_key(|&i| (queue[i].created_at, queue[i].id));
            claimable.truncate(limit as usize);
            let now = Utc::now().naive_utc();
            let mut claimed = Vec::with_capacity(claimable.len());
            for i in claimable {
                let entry = &mut queue[i];
                entry.status = QueueStatus::Processing;
                entry.last_attempt = Some(now);
                claimed.push(entry.clone());
            }
            Ok(claimed)
        });
        Box::pin(async move { out })
    }

    fn release_claims(&self, spec: &TableSpec, entry_ids: Vec<u64>) -> StoreFuture<'_, ()> {
        let out = self.check_reachable(&spec.name).map(|()| {
            let mut inner = self.inner.lock().unwrap();
            if let Some(queue) = inner.queues.get_mut(&spec.queue_table) {
                for entry in queue.iter_mut() {
                    if entry_ids.contains(&entry.id) && entry.status == QueueStatus::Processing {
                        entry.status = QueueStatus::Pending;
                    }
                }
            }
        });
        Box::pin(async move { out })
    }

    fn ack_entry(&self, spec: &TableSpec, entry_id: u64) -> StoreFuture<'_, ()> {
        let out = self.check_reachable(&spec.name).map(|()| {
            let mut inner = self.inner.lock().unwrap();
            if let Some(queue) = inner.queues.get_mut(&spec.queue_table) {
                queue.retain(|e| e.id != entry_id);
            }
        });
        Box::pin(async move { out })
    }

    fn fail_entry(
        &self,
        spec: &TableSpec,
        entry_id: u64,
        next: QueueStatus,
    ) -> StoreFuture<'_, ()> {
        let out = self.check_reachable(&spec.name).map(|()| {
            let mut inner = self.inner.lock().unwrap();
            if let Some(queue) = inner.queues.get_mut(&spec.queue_table) {
                if let Some(entry) = queue.iter_mut().find(|e| e.id == entry_id) {
                    entry.attempts += 1;
                    entry.last_attempt = Some(Utc::now().naive_utc());
                    entry.status = next;
                }
            }
        });
        Box::pin(async move { out })
    }

    fn fetch_row(&self, spec: &TableSpec, record_id: i64) -> StoreFuture<'_, Option<Record>> {
        let out = self
            .check_reachable(&spec.name)
            .map(|()| self.row(spec, record_id));
        Box::pin(async move { out })
    }

    fn replace_row(&self, spec: &TableSpec, record: Record) -> StoreFuture<'_, ()> {
        let out = (|| {
            self.check_reachable(&spec.name)?;
            let id = record.id(&spec.primary_key).ok_or_else(|| {
                SyncError::Internal(format!(
                    "record for `{}` lacks integer primary key `{}`",
                    spec.name, spec.primary_key
                ))
            })?;
            self.check_write_budget(&spec.name, id)?;
            let mut inner = self.inner.lock().unwrap();
            inner
                .tables
                .get_mut(&spec.name)
                .ok_or_else(|| {
                    SyncError::Internal(format!("table `{}` not registered", spec.name))
                })?
                .insert(id, record);
            Ok(())
        })();
        Box::pin(async move { out })
    }

    fn delete_row(&self, spec: &TableSpec, record_id: i64) -> StoreFuture<'_, bool> {
        let out = (|| {
            self.check_reachable(&spec.name)?;
            self.check_write_budget(&spec.name, record_id)?;
            let mut inner = self.inner.lock().unwrap();
            Ok(inner
                .tables
                .get_mut(&spec.name)
                .map(|t| t.remove(&record_id).is_some())
                .unwrap_or(false))
        })();
        Box::pin(async move { out })
    }

    fn scan_watermarks(
        &self,
        spec: &TableSpec,
        since: NaiveDateTime,
        limit: u32,
    ) -> StoreFuture<'_, Vec<(i64, NaiveDateTime)>> {
        let out = (|| {
            self.check_reachable(&spec.name)?;
            let column = spec.timestamp_column.as_deref().ok_or_else(|| {
                SyncError::WatermarkMissing {
                    node: self.label.clone(),
                    table: spec.name.clone(),
                    column: "sync_timestamp".to_string(),
                }
            })?;
            let inner = self.inner.lock().unwrap();
            let mut hits: Vec<(i64, NaiveDateTime)> = inner
                .tables
                .get(&spec.name)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|(id, row)| {
                            row.get(column)
                                .and_then(SqlValue::as_datetime)
                                .filter(|ts| *ts >= since)
                                .map(|ts| (*id, ts))
                        })
                        .collect()
                })
                .unwrap_or_default();
            hits.sort_by_key(|&(id, ts)| (ts, id));
            hits.truncate(limit as usize);
            Ok(hits)
        })();
        Box::pin(async move { out })
    }

    fn probe_watermark(
        &self,
        spec: &TableSpec,
        record_id: i64,
    ) -> StoreFuture<'_, WatermarkProbe> {
        let out = (|| {
            self.check_reachable(&spec.name)?;
            let column = spec.timestamp_column.as_deref().unwrap_or("sync_timestamp");
            Ok(match self.row(spec, record_id) {
                None => WatermarkProbe::Missing,
                Some(row) => match row.get(column).and_then(SqlValue::as_datetime) {
                    Some(ts) => WatermarkProbe::At(ts),
                    None => WatermarkProbe::Unstamped,
                },
            })
        })();
        Box::pin(async move { out })
    }

    fn has_watermark_column(&self, spec: &TableSpec) -> StoreFuture<'_, bool> {
        let out = self.check_reachable(&spec.name).map(|()| {
            spec.timestamp_column.is_some()
                && self.inner.lock().unwrap().tables.contains_key(&spec.name)
        });
        Box::pin(async move { out })
    }

    fn has_queue_table(&self, spec: &TableSpec) -> StoreFuture<'_, bool> {
        let out = self
            .check_reachable(&spec.name)
            .map(|()| self.inner.lock().unwrap().queues.contains_key(&spec.queue_table));
        Box::pin(async move { out })
    }

    fn has_capture_triggers(&self, spec: &TableSpec) -> StoreFuture<'_, bool> {
        let out = self.check_reachable(&spec.name).map(|()| {
            self.triggers_installed.load(Ordering::SeqCst)
                && self.inner.lock().unwrap().tables.contains_key(&spec.name)
        });
        Box::pin(async move { out })
    }

    fn queue_depth(&self, spec: &TableSpec) -> StoreFuture<'_, QueueDepth> {
        let out = self.check_reachable(&spec.name).map(|()| {
            let inner = self.inner.lock().unwrap();
            let mut depth = QueueDepth::default();
            if let Some(queue) = inner.queues.get(&spec.queue_table) {
                for entry in queue {
                    match entry.status {
                        QueueStatus::Pending => depth.pending += 1,
                        QueueStatus::Processing => depth.processing += 1,
                        QueueStatus::Failed => depth.failed += 1,
                    }
                }
            }
            depth
        });
        Box::pin(async move { out })
    }
}
