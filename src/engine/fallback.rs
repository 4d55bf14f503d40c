// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timestamp fallback: reconcile drift the queue path missed.
//!
//! Bulk imports bypass triggers, triggers get dropped during
//! maintenance, queue tables get truncated. The fallback scans source
//! rows whose `sync_timestamp` falls inside a window, compares each
//! against the destination's timestamp for the same key, and pushes the
//! row when the destination is missing, unstamped, or older.
//!
//! Deletes are out of scope here: a row absent from the source says
//! nothing about when it disappeared, so only the queue path propagates
//! deletes. The fallback also never touches rows whose timestamps
//! already agree, which keeps repeated calls cheap and idempotent.

use chrono::NaiveDateTime;
use tracing::{debug, info_span, warn, Instrument};

use crate::engine::types::{Direction, TableReport};
use crate::error::SyncError;
use crate::metrics;
use crate::record::TableSpec;
use crate::store::SyncStore;

/// Reconcile one table in one direction over rows stamped at or after
/// `since`. Connectivity failures abort the remaining scan for this
/// table; per-row failures are counted and the scan continues.
pub(crate) async fn fallback_table<S: SyncStore>(
    source: &S,
    destination: &S,
    direction: Direction,
    spec: &TableSpec,
    since: NaiveDateTime,
    scan_limit: u32,
) -> TableReport {
    let span = info_span!(
        "fallback",
        direction = %direction,
        table = %spec.name,
        since = %since,
    );
    async move {
        let mut report = TableReport::new(&spec.name);

        // Both sides must carry the watermark column; failing loudly
        // beats reconciling nothing while looking healthy.
        for node in [source, destination] {
            match node.has_watermark_column(spec).await {
                Ok(true) => {}
                Ok(false) => {
                    let err = SyncError::WatermarkMissing {
                        node: node.label().to_string(),
                        table: spec.name.clone(),
                        column: spec
                            .timestamp_column
                            .clone()
                            .unwrap_or_else(|| "sync_timestamp".to_string()),
                    };
                    warn!(error = %err, "Fallback unavailable for table");
                    report.abort(err);
                    return report;
                }
                Err(e) => {
                    report.abort(e);
                    return report;
                }
            }
        }

        let hits = match source.scan_watermarks(spec, since, scan_limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Fallback scan failed");
                metrics::record_direction_abort(direction.as_str(), &spec.name);
                report.abort(e);
                return report;
            }
        };
        report.examined = hits.len() as u64;
        metrics::record_fallback_rows_examined(direction.as_str(), &spec.name, hits.len());
        if hits.len() as u64 >= u64::from(scan_limit) {
            warn!(
                scanned = hits.len(),
                scan_limit,
                "Fallback scan hit the row limit, rows beyond it wait for the next call"
            );
        }

        for (record_id, source_ts) in hits {
            let stale = match destination.probe_watermark(spec, record_id).await {
                Ok(probe) => probe.is_stale_against(source_ts),
                Err(e) if e.is_connectivity() => {
                    metrics::record_direction_abort(direction.as_str(), &spec.name);
                    report.abort(e);
                    break;
                }
                Err(e) => {
                    warn!(record_id, error = %e, "Failed to probe destination watermark");
                    report.failed += 1;
                    continue;
                }
            };
            if !stale {
                continue;
            }

            match source.fetch_row(spec, record_id).await {
                Ok(Some(record)) => match destination.replace_row(spec, record).await {
                    Ok(()) => {
                        report.applied += 1;
                        metrics::record_fallback_rows_applied(direction.as_str(), &spec.name, 1);
                        debug!(record_id, "Fallback copied row");
                    }
                    Err(e) if e.is_connectivity() => {
                        metrics::record_direction_abort(direction.as_str(), &spec.name);
                        report.abort(e);
                        break;
                    }
                    Err(e) => {
                        warn!(record_id, error = %e, "Fallback failed to apply row");
                        report.failed += 1;
                    }
                },
                // Deleted since the scan; the queue path owns deletes.
                Ok(None) => debug!(record_id, "Row vanished between scan and fetch"),
                Err(e) if e.is_connectivity() => {
                    metrics::record_direction_abort(direction.as_str(), &spec.name);
                    report.abort(e);
                    break;
                }
                Err(e) => {
                    warn!(record_id, error = %e, "Fallback failed to read source row");
                    report.failed += 1;
                }
            }
        }
        report
    }
    .instrument(span)
    .await
}
