//! Offline provisioning: queue tables, capture triggers, schema diffing.
//!
//! Nothing here runs at steady state. Provisioning establishes the
//! contract the drain path relies on: every participating table has a
//! queue table and three capture triggers on both nodes before the
//! first `sync()` call. Re-running [`install`] is safe; it recreates
//! triggers and leaves an existing queue table (and its entries) alone.
//!
//! Schema changes are reported, never applied: [`diff_schemas`] compares
//! column name, type, nullability, and default between the two nodes and
//! returns the mismatches for an operator to act on.

use serde::Serialize;
use sqlx::Row;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::queue::QueueOp;
use crate::record::TableSpec;
use crate::store::mysql::MySqlNode;
use crate::store::SyncStore;
use crate::suppress::SENTINEL_VAR;

/// Queue-table DDL for one participating table.
///
/// The shape is load-bearing: the claim, ack, and depth statements in
/// [`crate::queue`] assume exactly these columns and indexes.
pub fn queue_table_ddl(spec: &TableSpec) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {queue} (
    id INT NOT NULL AUTO_INCREMENT,
    table_name VARCHAR(64) NOT NULL,
    record_id INT NOT NULL,
    operation ENUM('insert','update','delete') NOT NULL,
    old_data TEXT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    attempts INT NOT NULL DEFAULT 0,
    last_attempt TIMESTAMP NULL,
    status ENUM('pending','processing','failed') NOT NULL DEFAULT 'pending',
    PRIMARY KEY (id),
    INDEX idx_record_operation (record_id, operation),
    INDEX idx_status_created (status, created_at)
) ENGINE=InnoDB"#,
        queue = spec.queue_table,
    )
}

/// Capture trigger for row inserts. Records operation and primary key
/// only; the drain path re-reads the current row, so no payload is
/// captured here.
pub fn insert_trigger_ddl(spec: &TableSpec) -> String {
    format!(
        r#"CREATE TRIGGER {trigger}
AFTER INSERT ON {table}
FOR EACH ROW
BEGIN
    IF {sentinel} IS NULL THEN
        INSERT INTO {queue} (table_name, record_id, operation)
        VALUES ('{table}', NEW.{pk}, 'insert');
    END IF;
END"#,
        trigger = spec.trigger_name("insert"),
        table = spec.name,
        queue = spec.queue_table,
        pk = spec.primary_key,
        sentinel = SENTINEL_VAR,
    )
}

/// Capture trigger for row updates.
pub fn update_trigger_ddl(spec: &TableSpec) -> String {
    format!(
        r#"CREATE TRIGGER {trigger}
AFTER UPDATE ON {table}
FOR EACH ROW
BEGIN
    IF {sentinel} IS NULL THEN
        INSERT INTO {queue} (table_name, record_id, operation)
        VALUES ('{table}', NEW.{pk}, 'update');
    END IF;
END"#,
        trigger = spec.trigger_name("update"),
        table = spec.name,
        queue = spec.queue_table,
        pk = spec.primary_key,
        sentinel = SENTINEL_VAR,
    )
}

/// Capture trigger for row deletes.
///
/// The after-row no longer exists, so `record_id` comes from the old
/// row, and the full old row is snapshotted into `old_data` as JSON
/// for manual forensics. The drain path only reads `record_id`.
pub fn delete_trigger_ddl(spec: &TableSpec, columns: &[String]) -> Result<String> {
    if columns.is_empty() {
        return Err(SyncError::Config(format!(
            "no columns discovered for table `{}`",
            spec.name
        )));
    }
    let mut pairs = String::new();
    for (i, name) in columns.iter().enumerate() {
        if name.contains('`') || name.contains('\'') {
            return Err(SyncError::Config(format!(
                "unquotable column name on `{}`: {name}",
                spec.name
            )));
        }
        if i > 0 {
            pairs.push_str(", ");
        }
        pairs.push_str(&format!("'{name}', OLD.`{name}`"));
    }
    Ok(format!(
        r#"CREATE TRIGGER {trigger}
AFTER DELETE ON {table}
FOR EACH ROW
BEGIN
    IF {sentinel} IS NULL THEN
        INSERT INTO {queue} (table_name, record_id, operation, old_data)
        VALUES ('{table}', OLD.{pk}, 'delete', JSON_OBJECT({pairs}));
    END IF;
END"#,
        trigger = spec.trigger_name("delete"),
        table = spec.name,
        queue = spec.queue_table,
        pk = spec.primary_key,
        sentinel = SENTINEL_VAR,
    ))
}

fn drop_trigger_ddl(spec: &TableSpec, op: QueueOp) -> String {
    format!("DROP TRIGGER IF EXISTS {}", spec.trigger_name(op.as_str()))
}

/// Create the queue table and (re)create all three capture triggers
/// for one table on one node.
///
/// Idempotent: the queue table is created only if absent, triggers are
/// dropped and recreated so a changed column set is picked up.
pub async fn install(node: &MySqlNode, spec: &TableSpec) -> Result<()> {
    spec.validate()?;
    let pool = node.ensure_pool().await?;

    let columns = table_columns(node, &spec.name).await?;
    if columns.is_empty() {
        return Err(SyncError::Config(format!(
            "table `{}` does not exist on node `{}`",
            spec.name,
            node.label()
        )));
    }
    let column_names: Vec<String> = columns.into_iter().map(|c| c.name).collect();
    if !column_names.iter().any(|c| c == &spec.primary_key) {
        return Err(SyncError::Config(format!(
            "table `{}` on node `{}` has no `{}` column",
            spec.name,
            node.label(),
            spec.primary_key
        )));
    }

    sqlx::query(&queue_table_ddl(spec))
        .execute(&pool)
        .await
        .map_err(|e| SyncError::from_db(node.label(), e))?;

    let statements = [
        (QueueOp::Insert, insert_trigger_ddl(spec)),
        (QueueOp::Update, update_trigger_ddl(spec)),
        (QueueOp::Delete, delete_trigger_ddl(spec, &column_names)?),
    ];
    for (op, create) in statements {
        sqlx::query(&drop_trigger_ddl(spec, op))
            .execute(&pool)
            .await
            .map_err(|e| SyncError::from_db(node.label(), e))?;
        sqlx::query(&create)
            .execute(&pool)
            .await
            .map_err(|e| SyncError::from_db(node.label(), e))?;
    }

    info!(
        node = %node.label(),
        table = %spec.name,
        queue = %spec.queue_table,
        "Provisioned queue table and capture triggers"
    );
    Ok(())
}

/// Provision every configured table on one node.
pub async fn install_all(node: &MySqlNode, specs: &[TableSpec]) -> Result<()> {
    for spec in specs {
        install(node, spec).await?;
    }
    Ok(())
}

/// Drop the capture triggers for one table. The queue table and any
/// entries still in it are left in place.
pub async fn uninstall_triggers(node: &MySqlNode, spec: &TableSpec) -> Result<()> {
    let pool = node.ensure_pool().await?;
    for op in [QueueOp::Insert, QueueOp::Update, QueueOp::Delete] {
        sqlx::query(&drop_trigger_ddl(spec, op))
            .execute(&pool)
            .await
            .map_err(|e| SyncError::from_db(node.label(), e))?;
    }
    warn!(
        node = %node.label(),
        table = %spec.name,
        "Capture triggers dropped, changes to this table are no longer queued"
    );
    Ok(())
}

// =============================================================================
// Schema diffing
// =============================================================================

/// One column as `information_schema` describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    /// Full column type, e.g. `varchar(64)`.
    pub col_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

/// A column present on both nodes with differing definitions.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnMismatch {
    pub column: String,
    pub local: ColumnDef,
    pub remote: ColumnDef,
}

/// Schema comparison for one table between the two nodes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaDiff {
    pub table: String,
    /// Columns the remote node has and the local node lacks.
    pub missing_on_local: Vec<String>,
    /// Columns the local node has and the remote node lacks.
    pub missing_on_remote: Vec<String>,
    pub mismatched: Vec<ColumnMismatch>,
}

impl SchemaDiff {
    /// True when both nodes agree on every column.
    pub fn is_clean(&self) -> bool {
        self.missing_on_local.is_empty()
            && self.missing_on_remote.is_empty()
            && self.mismatched.is_empty()
    }
}

/// Column definitions for one table in the node's current database.
pub async fn table_columns(node: &MySqlNode, table: &str) -> Result<Vec<ColumnDef>> {
    let pool = node.ensure_pool().await?;
    let rows = sqlx::query(
        "SELECT column_name AS name, column_type AS col_type, \
                is_nullable AS nullable, column_default AS col_default \
         FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = ? \
         ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(&pool)
    .await
    .map_err(|e| SyncError::from_db(node.label(), e))?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let nullable: String = row.try_get("nullable")?;
        columns.push(ColumnDef {
            name: row.try_get("name")?,
            col_type: row.try_get("col_type")?,
            nullable: nullable.eq_ignore_ascii_case("yes"),
            default: row.try_get("col_default")?,
        });
    }
    Ok(columns)
}

/// Compare one table's columns between the two nodes. Reports only;
/// nothing is migrated.
pub async fn diff_schemas(
    local: &MySqlNode,
    remote: &MySqlNode,
    table: &str,
) -> Result<SchemaDiff> {
    let local_columns = table_columns(local, table).await?;
    let remote_columns = table_columns(remote, table).await?;
    let diff = diff_columns(table, &local_columns, &remote_columns);
    if !diff.is_clean() {
        warn!(
            table,
            missing_on_local = diff.missing_on_local.len(),
            missing_on_remote = diff.missing_on_remote.len(),
            mismatched = diff.mismatched.len(),
            "Schema drift between nodes"
        );
    }
    Ok(diff)
}

fn diff_columns(table: &str, local: &[ColumnDef], remote: &[ColumnDef]) -> SchemaDiff {
    let mut diff = SchemaDiff {
        table: table.to_string(),
        ..SchemaDiff::default()
    };
    for col in local {
        match remote.iter().find(|r| r.name == col.name) {
            None => diff.missing_on_remote.push(col.name.clone()),
            Some(other) if other != col => diff.mismatched.push(ColumnMismatch {
                column: col.name.clone(),
                local: col.clone(),
                remote: other.clone(),
            }),
            Some(_) => {}
        }
    }
    for col in remote {
        if !local.iter().any(|l| l.name == col.name) {
            diff.missing_on_local.push(col.name.clone());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TableSpec {
        TableSpec::new("guests", "id")
    }

    fn col(name: &str, col_type: &str, nullable: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            col_type: col_type.to_string(),
            nullable,
            default: None,
        }
    }

    #[test]
    fn test_queue_ddl_shape() {
        let ddl = queue_table_ddl(&spec());
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS guests_sync_queue"));
        assert!(ddl.contains("operation ENUM('insert','update','delete') NOT NULL"));
        assert!(ddl.contains("status ENUM('pending','processing','failed') NOT NULL DEFAULT 'pending'"));
        assert!(ddl.contains("INDEX idx_record_operation (record_id, operation)"));
        assert!(ddl.contains("INDEX idx_status_created (status, created_at)"));
    }

    #[test]
    fn test_insert_trigger_guards_suppression() {
        let ddl = insert_trigger_ddl(&spec());
        assert!(ddl.contains("CREATE TRIGGER guests_queue_insert"));
        assert!(ddl.contains("AFTER INSERT ON guests"));
        assert!(ddl.contains("IF @sync_in_progress IS NULL THEN"));
        assert!(ddl.contains("VALUES ('guests', NEW.id, 'insert')"));
    }

    #[test]
    fn test_update_trigger_uses_new_row() {
        let ddl = update_trigger_ddl(&spec());
        assert!(ddl.contains("AFTER UPDATE ON guests"));
        assert!(ddl.contains("NEW.id, 'update'"));
    }

    #[test]
    fn test_delete_trigger_snapshots_old_row() {
        let columns = vec!["id".to_string(), "remark".to_string()];
        let ddl = delete_trigger_ddl(&spec(), &columns).unwrap();
        assert!(ddl.contains("AFTER DELETE ON guests"));
        assert!(ddl.contains("OLD.id, 'delete'"));
        assert!(ddl.contains("JSON_OBJECT('id', OLD.`id`, 'remark', OLD.`remark`)"));
        assert!(ddl.contains("IF @sync_in_progress IS NULL THEN"));
    }

    #[test]
    fn test_delete_trigger_rejects_bad_columns() {
        assert!(delete_trigger_ddl(&spec(), &[]).is_err());
        assert!(delete_trigger_ddl(&spec(), &["bad`col".to_string()]).is_err());
        assert!(delete_trigger_ddl(&spec(), &["bad'col".to_string()]).is_err());
    }

    #[test]
    fn test_drop_trigger_ddl() {
        assert_eq!(
            drop_trigger_ddl(&spec(), QueueOp::Delete),
            "DROP TRIGGER IF EXISTS guests_queue_delete"
        );
    }

    #[test]
    fn test_diff_identical_schemas_is_clean() {
        let columns = vec![col("id", "int", false), col("remark", "varchar(255)", true)];
        let diff = diff_columns("guests", &columns, &columns);
        assert!(diff.is_clean());
    }

    #[test]
    fn test_diff_reports_missing_columns() {
        let local = vec![col("id", "int", false), col("extra", "int", true)];
        let remote = vec![col("id", "int", false), col("other", "int", true)];
        let diff = diff_columns("guests", &local, &remote);
        assert_eq!(diff.missing_on_remote, vec!["extra"]);
        assert_eq!(diff.missing_on_local, vec!["other"]);
        assert!(!diff.is_clean());
    }

    #[test]
    fn test_diff_reports_type_and_nullability_drift() {
        let local = vec![col("remark", "varchar(255)", true)];
        let remote = vec![col("remark", "varchar(64)", false)];
        let diff = diff_columns("guests", &local, &remote);
        assert_eq!(diff.mismatched.len(), 1);
        assert_eq!(diff.mismatched[0].column, "remark");
        assert_eq!(diff.mismatched[0].local.col_type, "varchar(255)");
        assert_eq!(diff.mismatched[0].remote.col_type, "varchar(64)");
    }
}
