// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Sync Engine
//!
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker / OrbStack)
//! cargo test --test integration -- --ignored
//!
//! # Run specific test
//! cargo test --test integration round_trip -- --ignored
//! ```
//!
//! # Test Organization
//! - `provision_*` - Queue table and trigger installation
//! - `capture_*` - Trigger-based change capture and suppression
//! - `sync_*` - Two-node drain round trips
//! - `fallback_*` - Timestamp fallback reconciliation

mod common;

use common::{pair_config, HotelDb};
use duplex_sync::provision;
use duplex_sync::store::SyncStore;
use duplex_sync::suppress;
use duplex_sync::{MySqlNode, SyncEngine, TableSpec};
use futures::future::BoxFuture;
use testcontainers::clients::Cli;

fn guests_spec() -> TableSpec {
    TableSpec::new("guests", "id").with_timestamp_column("sync_timestamp")
}

/// Spin up one provisioned node over a fresh container.
async fn provisioned_node<'a>(docker: &'a Cli, label: &str) -> (HotelDb<'a>, MySqlNode) {
    let db = HotelDb::new(docker);
    db.create_hotel_schema().await.unwrap();
    let node = MySqlNode::new(label, db.node_config());
    node.connect().await.unwrap();
    provision::install(&node, &guests_spec()).await.unwrap();
    (db, node)
}

// =============================================================================
// Provisioning
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn provision_installs_queue_table_and_triggers() {
    let docker = Cli::default();
    let (_db, node) = provisioned_node(&docker, "local").await;
    let spec = guests_spec();

    assert!(node.has_queue_table(&spec).await.unwrap());
    assert!(node.has_capture_triggers(&spec).await.unwrap());
    assert!(node.has_watermark_column(&spec).await.unwrap());

    // Installing again must not fail or duplicate anything.
    provision::install(&node, &spec).await.unwrap();
    assert!(node.has_capture_triggers(&spec).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn provision_rejects_missing_table() {
    let docker = Cli::default();
    let db = HotelDb::new(&docker);
    db.create_hotel_schema().await.unwrap();
    let node = MySqlNode::new("local", db.node_config());
    node.connect().await.unwrap();

    let spec = TableSpec::new("no_such_table", "id");
    let err = provision::install(&node, &spec).await.unwrap_err();
    assert!(err.to_string().contains("no_such_table"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn provision_diff_reports_schema_drift() {
    let docker = Cli::default();
    let local = HotelDb::new(&docker);
    let remote = HotelDb::new(&docker);
    local.create_hotel_schema().await.unwrap();
    remote.create_hotel_schema().await.unwrap();

    let node_a = MySqlNode::new("local", local.node_config());
    let node_b = MySqlNode::new("remote", remote.node_config());
    node_a.connect().await.unwrap();
    node_b.connect().await.unwrap();

    let diff = provision::diff_schemas(&node_a, &node_b, "guests")
        .await
        .unwrap();
    assert!(diff.is_clean());

    local
        .run("ALTER TABLE guests ADD COLUMN loyalty_tier INT NULL")
        .await
        .unwrap();
    remote
        .run("ALTER TABLE guests MODIFY COLUMN remark VARCHAR(64) NULL")
        .await
        .unwrap();

    let diff = provision::diff_schemas(&node_a, &node_b, "guests")
        .await
        .unwrap();
    assert!(!diff.is_clean());
    assert_eq!(diff.missing_on_remote, vec!["loyalty_tier"]);
    assert_eq!(diff.mismatched.len(), 1);
    assert_eq!(diff.mismatched[0].column, "remark");
}

// =============================================================================
// Change Capture
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn capture_records_application_writes() {
    let docker = Cli::default();
    let (db, _node) = provisioned_node(&docker, "local").await;

    db.insert_guest(1, "Ada Lutz").await.unwrap();
    db.update_guest(1, "late checkout").await.unwrap();
    db.delete_guest(1).await.unwrap();

    let queue = "guests_sync_queue";
    assert_eq!(db.queue_count(queue, None).await.unwrap(), 3);
    assert_eq!(db.queue_count(queue, Some("pending")).await.unwrap(), 3);

    // The delete entry snapshots the old row as JSON.
    let (operation, old_data) = db.newest_queue_entry(queue).await.unwrap().unwrap();
    assert_eq!(operation, "delete");
    let snapshot = old_data.expect("delete must snapshot the old row");
    let json: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(json["full_name"], "Ada Lutz");
    assert_eq!(json["remark"], "late checkout");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn capture_skips_suppressed_connections() {
    let docker = Cli::default();
    let (db, node) = provisioned_node(&docker, "local").await;

    let conn = node.pool().await.unwrap().acquire().await.unwrap();
    suppress::with_suppression(conn, |conn| {
        Box::pin(async move {
            sqlx::query("INSERT INTO guests (id, full_name) VALUES (9, 'Quiet Writer')")
                .execute(&mut *conn)
                .await?;
            Ok(())
        }) as BoxFuture<'_, duplex_sync::Result<()>>
    })
    .await
    .unwrap();

    // The row exists but no queue entry was captured.
    assert!(db.guest(9).await.unwrap().is_some());
    assert_eq!(db.queue_count("guests_sync_queue", None).await.unwrap(), 0);

    // The sentinel is connection-scoped: ordinary writes still capture.
    db.insert_guest(10, "Loud Writer").await.unwrap();
    assert_eq!(db.queue_count("guests_sync_queue", None).await.unwrap(), 1);
}

// =============================================================================
// Two-Node Round Trips
// =============================================================================

async fn paired_engine<'a>(
    local: &HotelDb<'a>,
    remote: &HotelDb<'a>,
) -> SyncEngine {
    local.create_hotel_schema().await.unwrap();
    remote.create_hotel_schema().await.unwrap();

    let engine = SyncEngine::new(pair_config(local, remote)).unwrap();
    engine.connect().await.unwrap();
    provision::install_all(engine.local(), engine.tables())
        .await
        .unwrap();
    provision::install_all(engine.remote(), engine.tables())
        .await
        .unwrap();
    engine
}

#[tokio::test]
#[ignore] // Requires Docker
async fn sync_round_trips_insert_update_delete() {
    let docker = Cli::default();
    let local = HotelDb::new(&docker);
    let remote = HotelDb::new(&docker);
    let engine = paired_engine(&local, &remote).await;

    // Insert on local propagates to remote.
    local.insert_guest(1, "Ada Lutz").await.unwrap();
    let report = engine.sync("test").await;
    assert!(report.success, "report: {report:?}");
    assert_eq!(report.local_to_remote.applied, 1);
    let (name, _) = remote.guest(1).await.unwrap().unwrap();
    assert_eq!(name, "Ada Lutz");

    // Engine writes are suppressed: nothing echoed onto remote's queue.
    assert_eq!(
        remote.queue_count("guests_sync_queue", None).await.unwrap(),
        0
    );

    // Update on remote propagates back.
    remote.update_guest(1, "late checkout").await.unwrap();
    let report = engine.sync("test").await;
    assert!(report.success);
    assert_eq!(report.remote_to_local.applied, 1);
    let (_, remark) = local.guest(1).await.unwrap().unwrap();
    assert_eq!(remark.as_deref(), Some("late checkout"));

    // Delete on local removes the remote row.
    local.delete_guest(1).await.unwrap();
    let report = engine.sync("test").await;
    assert!(report.success);
    assert_eq!(report.local_to_remote.deleted, 1);
    assert!(remote.guest(1).await.unwrap().is_none());

    // Queues drained on both sides.
    assert_eq!(local.queue_count("guests_sync_queue", None).await.unwrap(), 0);
    assert_eq!(
        remote.queue_count("guests_sync_queue", None).await.unwrap(),
        0
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn sync_coalesces_rapid_edits() {
    let docker = Cli::default();
    let local = HotelDb::new(&docker);
    let remote = HotelDb::new(&docker);
    let engine = paired_engine(&local, &remote).await;

    local.insert_guest(2, "Bo Keller").await.unwrap();
    local.update_guest(2, "vegetarian").await.unwrap();
    local.update_guest(2, "vegan").await.unwrap();

    let report = engine.sync("test").await;
    assert!(report.success);
    // Three queue entries collapse into one destination write.
    assert_eq!(report.local_to_remote.applied, 1);
    let table = &report.local_to_remote.tables[0];
    assert_eq!(table.claimed, 3);
    assert_eq!(table.skipped, 2);

    let (_, remark) = remote.guest(2).await.unwrap().unwrap();
    assert_eq!(remark.as_deref(), Some("vegan"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn check_queue_tables_gates_on_provisioning() {
    let docker = Cli::default();
    let local = HotelDb::new(&docker);
    let remote = HotelDb::new(&docker);
    local.create_hotel_schema().await.unwrap();
    remote.create_hotel_schema().await.unwrap();

    let engine = SyncEngine::new(pair_config(&local, &remote)).unwrap();
    engine.connect().await.unwrap();

    // Nothing provisioned yet.
    assert!(!engine.check_queue_tables().await.unwrap());

    provision::install_all(engine.local(), engine.tables())
        .await
        .unwrap();
    assert!(!engine.check_queue_tables().await.unwrap());

    provision::install_all(engine.remote(), engine.tables())
        .await
        .unwrap();
    assert!(engine.check_queue_tables().await.unwrap());

    // Losing a trigger flips the check back to false.
    remote.run("DROP TRIGGER guests_queue_update").await.unwrap();
    assert!(!engine.check_queue_tables().await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn concurrent_claims_never_overlap() {
    let docker = Cli::default();
    let (db, node_a) = provisioned_node(&docker, "a").await;
    let node_b = MySqlNode::new("b", db.node_config());
    node_b.connect().await.unwrap();

    for id in 1..=20 {
        db.insert_guest(id, "Guest").await.unwrap();
    }

    let spec = guests_spec();
    let (batch_a, batch_b) =
        tokio::join!(node_a.claim_batch(&spec, 10), node_b.claim_batch(&spec, 10));
    let batch_a = batch_a.unwrap();
    let batch_b = batch_b.unwrap();

    assert_eq!(batch_a.len(), 10);
    assert_eq!(batch_b.len(), 10);
    let ids_a: std::collections::HashSet<u64> = batch_a.iter().map(|e| e.id).collect();
    assert!(batch_b.iter().all(|e| !ids_a.contains(&e.id)));

    // Released entries become claimable again.
    let ids: Vec<u64> = batch_b.iter().map(|e| e.id).collect();
    node_b.release_claims(&spec, ids).await.unwrap();
    assert_eq!(
        db.queue_count("guests_sync_queue", Some("pending"))
            .await
            .unwrap(),
        10
    );
}

// =============================================================================
// Timestamp Fallback
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn fallback_reconciles_untracked_writes() {
    let docker = Cli::default();
    let local = HotelDb::new(&docker);
    let remote = HotelDb::new(&docker);
    let engine = paired_engine(&local, &remote).await;

    // Simulate a capture outage: triggers dropped, writes land silently.
    provision::uninstall_triggers(engine.local(), &guests_spec())
        .await
        .unwrap();
    local.insert_guest(7, "Ghost Writer").await.unwrap();

    // The queue knows nothing about the row.
    let report = engine.sync("test").await;
    assert!(report.success);
    assert!(remote.guest(7).await.unwrap().is_none());

    // The watermark scan finds and copies it.
    let report = engine.force_sync_latest(Some(24), "guests").await.unwrap();
    assert!(report.success, "report: {report:?}");
    assert_eq!(report.local_to_remote.applied, 1);
    let (name, _) = remote.guest(7).await.unwrap().unwrap();
    assert_eq!(name, "Ghost Writer");

    // A second pass finds both sides current.
    let report = engine.force_sync_latest(Some(24), "guests").await.unwrap();
    assert_eq!(report.total_applied(), 0);
}
