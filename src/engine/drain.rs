//! Queue drain: claim a batch, coalesce per record, re-read the source
//! row, apply to the destination.
//!
//! Application trusts the source table, not the captured entry: an
//! insert/update entry is only a hint to re-read the current row, so
//! several queued changes to one record collapse into a single apply
//! carrying the latest value. A row that vanished between capture and
//! drain is reclassified as a delete.
//!
//! Failure scope is one table's batch: a connectivity failure releases
//! the unapplied claims and moves on to the next table, while a
//! destination constraint failure marks just that record's entries and
//! continues. Entries applied before a cut stay applied.

use std::time::Instant;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::DrainConfig;
use crate::engine::types::{Direction, DirectionReport, TableReport};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::queue::{QueueEntry, QueueOp, QueueStatus};
use crate::record::{Record, TableSpec};
use crate::store::SyncStore;

/// Queue entries for one record, collapsed to one effective apply.
#[derive(Debug)]
struct ApplyGroup {
    record_id: i64,
    /// Operation of the newest entry; older entries are superseded.
    op: QueueOp,
    /// All claimed entries for this record, oldest first.
    entries: Vec<QueueEntry>,
}

/// Collapse a claimed batch into per-record apply groups, preserving
/// oldest-first order across records.
fn coalesce(entries: Vec<QueueEntry>) -> Vec<ApplyGroup> {
    let mut groups: Vec<ApplyGroup> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|g| g.record_id == entry.record_id) {
            Some(group) => {
                group.op = entry.operation;
                group.entries.push(entry);
            }
            None => groups.push(ApplyGroup {
                record_id: entry.record_id,
                op: entry.operation,
                entries: vec![entry],
            }),
        }
    }
    groups
}

/// What the destination write for a group will be.
enum Planned {
    Replace(Record),
    Delete,
}

/// Run one direction of a sync pass over every configured table.
pub(crate) async fn drain_direction<S: SyncStore>(
    source: &S,
    destination: &S,
    direction: Direction,
    specs: &[TableSpec],
    config: &DrainConfig,
    deadline: Option<Instant>,
) -> DirectionReport {
    let span = info_span!(
        "drain",
        direction = %direction,
        source = source.label(),
        destination = destination.label(),
    );
    async move {
        let mut report = DirectionReport::default();
        for spec in specs {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!(table = %spec.name, "Time budget exhausted, stopping direction");
                break;
            }
            report.absorb(drain_table(source, destination, direction, spec, config, deadline).await);
        }
        report
    }
    .instrument(span)
    .await
}

/// Drain one table's queue in one direction.
async fn drain_table<S: SyncStore>(
    source: &S,
    destination: &S,
    direction: Direction,
    spec: &TableSpec,
    config: &DrainConfig,
    deadline: Option<Instant>,
) -> TableReport {
    let mut report = TableReport::new(&spec.name);

    // The queue table is this direction's precondition; without it
    // there is nothing to claim and capture is not happening either.
    match source.has_queue_table(spec).await {
        Ok(true) => {}
        Ok(false) => {
            let err = SyncError::QueueTableMissing {
                node: source.label().to_string(),
                queue_table: spec.queue_table.clone(),
            };
            warn!(table = %spec.name, error = %err, "Skipping table");
            report.abort(err);
            return report;
        }
        Err(e) => {
            warn!(table = %spec.name, error = %e, "Queue table check failed");
            metrics::record_direction_abort(direction.as_str(), &spec.name);
            report.abort(e);
            return report;
        }
    }

    let claimed = match source.claim_batch(spec, config.batch_size).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(table = %spec.name, error = %e, "Failed to claim batch");
            metrics::record_direction_abort(direction.as_str(), &spec.name);
            report.abort(e);
            return report;
        }
    };
    if claimed.is_empty() {
        debug!(table = %spec.name, "Queue empty");
        return report;
    }
    report.claimed = claimed.len() as u64;
    metrics::record_entries_claimed(direction.as_str(), &spec.name, claimed.len());
    debug!(table = %spec.name, claimed = claimed.len(), "Claimed batch");

    let groups = coalesce(claimed);
    for (idx, group) in groups.iter().enumerate() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!(table = %spec.name, "Time budget exhausted, releasing remaining claims");
            release_groups(source, spec, &groups[idx..]).await;
            report.abort("time budget exhausted");
            break;
        }
        if let Err(e) = apply_group(source, destination, direction, spec, group, config, &mut report).await
        {
            warn!(
                table = %spec.name,
                record_id = group.record_id,
                error = %e,
                "Aborting table batch, releasing remaining claims"
            );
            release_groups(source, spec, &groups[idx..]).await;
            metrics::record_direction_abort(direction.as_str(), &spec.name);
            report.abort(e);
            break;
        }
    }
    report
}

/// Apply one coalesced group. `Err` means this table's batch must stop
/// (connectivity or a queue that stopped acknowledging); per-record
/// destination failures are absorbed into the report and return `Ok`.
async fn apply_group<S: SyncStore>(
    source: &S,
    destination: &S,
    direction: Direction,
    spec: &TableSpec,
    group: &ApplyGroup,
    config: &DrainConfig,
    report: &mut TableReport,
) -> Result<()> {
    let planned = match group.op {
        QueueOp::Delete => Planned::Delete,
        QueueOp::Insert | QueueOp::Update => {
            match source.fetch_row(spec, group.record_id).await {
                Ok(Some(record)) => Planned::Replace(record),
                // Raced with a delete whose entry is still behind the
                // claim horizon; the row is gone either way.
                Ok(None) => Planned::Delete,
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    error!(
                        table = %spec.name,
                        record_id = group.record_id,
                        error = %e,
                        "Failed to read source row"
                    );
                    return fail_group(source, direction, spec, group, config, report).await;
                }
            }
        }
    };

    let op_label = match &planned {
        Planned::Replace(_) => group.op.as_str(),
        Planned::Delete => QueueOp::Delete.as_str(),
    };
    let outcome = match planned {
        Planned::Replace(record) => destination.replace_row(spec, record).await.map(|()| false),
        Planned::Delete => destination
            .delete_row(spec, group.record_id)
            .await
            .map(|_| true),
    };

    match outcome {
        Ok(was_delete) => {
            for entry in &group.entries {
                source.ack_entry(spec, entry.id).await?;
            }
            if was_delete {
                report.deleted += 1;
            } else {
                report.applied += 1;
            }
            report.skipped += group.entries.len() as u64 - 1;
            metrics::record_entries_applied(direction.as_str(), &spec.name, op_label, 1);
            debug!(
                table = %spec.name,
                record_id = group.record_id,
                operation = op_label,
                coalesced = group.entries.len(),
                "Applied"
            );
            Ok(())
        }
        Err(e) if e.is_connectivity() => Err(e),
        Err(e) => {
            // Constraint or validation failure on the destination row.
            // The error carries the database detail for remediation.
            error!(
                table = %spec.name,
                record_id = group.record_id,
                operation = op_label,
                error = %e,
                "Failed to apply to destination"
            );
            fail_group(source, direction, spec, group, config, report).await
        }
    }
}

/// Record a failed apply on every entry of the group. Each entry's own
/// attempt count decides whether it re-queues or parks as failed.
async fn fail_group<S: SyncStore>(
    source: &S,
    direction: Direction,
    spec: &TableSpec,
    group: &ApplyGroup,
    config: &DrainConfig,
    report: &mut TableReport,
) -> Result<()> {
    for entry in &group.entries {
        let next = entry.status_after_failure(config.retry_limit);
        source.fail_entry(spec, entry.id, next).await?;
        if next == QueueStatus::Failed {
            report.failed += 1;
            metrics::record_entry_failed(direction.as_str(), &spec.name);
        } else {
            report.requeued += 1;
            metrics::record_entry_requeued(direction.as_str(), &spec.name);
        }
    }
    Ok(())
}

/// Return every claim in the given groups to `pending`. Failure here is
/// tolerated: the stale-claim threshold reclaims them eventually.
async fn release_groups<S: SyncStore>(source: &S, spec: &TableSpec, groups: &[ApplyGroup]) {
    let ids: Vec<u64> = groups
        .iter()
        .flat_map(|g| g.entries.iter().map(|e| e.id))
        .collect();
    if ids.is_empty() {
        return;
    }
    if let Err(e) = source.release_claims(spec, ids).await {
        warn!(
            node = source.label(),
            table = %spec.name,
            error = %e,
            "Failed to release claims, stale reclaim will recover them"
        );
    }
}
