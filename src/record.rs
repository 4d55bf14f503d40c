// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Generic row model for replicated tables.
//!
//! The engine is table-driven: it never compiles per-table structs.
//! A [`Record`] is an ordered column→value map read straight off the
//! wire, and a [`TableSpec`] is the registry entry describing how one
//! table participates in sync (primary key, queue table, watermark
//! column). Applying a record means replacing the destination row
//! wholesale with these values, so fidelity of the value model matters
//! more than ergonomics.
//!
//! # Value Model
//!
//! [`SqlValue`] covers the MySQL scalar types the reservation schema
//! uses (integers, floats, strings, binary, temporal). `DECIMAL` is
//! carried as text to avoid precision loss; `ENUM`/`SET` come back as
//! text from the driver already.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::mysql::{MySql, MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::error::{Result, SyncError};

/// Maximum identifier length accepted by MySQL.
const MAX_IDENTIFIER_LEN: usize = 64;

/// A single MySQL column value, as read from or bound into a row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    /// VARCHAR/CHAR/TEXT/ENUM/SET, and DECIMAL carried as text.
    Text(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Interpret this value as an integer primary key, if possible.
    pub fn as_id(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Interpret this value as a watermark timestamp, if possible.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::DateTime(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Bind this value onto a dynamically-built query.
    ///
    /// Table and column names are interpolated as validated identifiers;
    /// values always go through bind parameters.
    pub fn bind_to<'q>(
        &'q self,
        query: Query<'q, MySql, MySqlArguments>,
    ) -> Query<'q, MySql, MySqlArguments> {
        match self {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::UInt(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::DateTime(v) => query.bind(v),
            SqlValue::Date(v) => query.bind(v),
            SqlValue::Time(v) => query.bind(v),
        }
    }

    /// Render as JSON for old-row snapshots and report payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Int(v) => serde_json::json!(v),
            SqlValue::UInt(v) => serde_json::json!(v),
            SqlValue::Float(v) => serde_json::json!(v),
            SqlValue::Text(v) => serde_json::json!(v),
            // Snapshots are diagnostic only; binary is tagged hex, not
            // round-tripped.
            SqlValue::Bytes(v) => serde_json::json!(format!("0x{}", hex_encode(v))),
            SqlValue::DateTime(v) => serde_json::json!(v.format("%Y-%m-%d %H:%M:%S").to_string()),
            SqlValue::Date(v) => serde_json::json!(v.format("%Y-%m-%d").to_string()),
            SqlValue::Time(v) => serde_json::json!(v.format("%H:%M:%S").to_string()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::UInt(v) => write!(f, "{v}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(v) => write!(f, "{v}"),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            SqlValue::DateTime(v) => write!(f, "{v}"),
            SqlValue::Date(v) => write!(f, "{v}"),
            SqlValue::Time(v) => write!(f, "{v}"),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One row of a replicated table: column name → value.
///
/// Columns are kept in a `BTreeMap` so iteration order (and therefore
/// generated SQL) is deterministic regardless of the source SELECT.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    columns: BTreeMap<String, SqlValue>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value, replacing any previous value.
    pub fn set(&mut self, column: impl Into<String>, value: SqlValue) -> &mut Self {
        self.columns.insert(column.into(), value);
        self
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    /// The primary key value under `pk_column`, if present and integral.
    pub fn id(&self, pk_column: &str) -> Option<i64> {
        self.columns.get(pk_column).and_then(SqlValue::as_id)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in deterministic order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// (column, value) pairs in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Render the whole row as a JSON object string.
    ///
    /// Matches the shape delete triggers write into `old_data`.
    pub fn to_json_string(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}

impl FromIterator<(String, SqlValue)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, SqlValue)>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// Decode a full row into a [`Record`], mapping MySQL types onto
/// [`SqlValue`] variants by the driver's reported type name.
///
/// Unknown types fall back to a text decode so schema additions don't
/// break the drain; a value that can't even decode as text is an error.
pub fn decode_row(row: &MySqlRow) -> Result<Record> {
    let mut record = Record::new();
    for (i, col) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            record.set(col.name(), SqlValue::Null);
            continue;
        }
        let type_name = col.type_info().name().to_uppercase();
        let value = match type_name.as_str() {
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" | "BOOLEAN" => {
                SqlValue::Int(row.try_get::<i64, _>(i)?)
            }
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" | "BIT" => SqlValue::UInt(row.try_get::<u64, _>(i)?),
            "FLOAT" | "DOUBLE" => SqlValue::Float(row.try_get::<f64, _>(i)?),
            "TIMESTAMP" | "DATETIME" => SqlValue::DateTime(row.try_get::<NaiveDateTime, _>(i)?),
            "DATE" => SqlValue::Date(row.try_get::<NaiveDate, _>(i)?),
            "TIME" => SqlValue::Time(row.try_get::<NaiveTime, _>(i)?),
            "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
                SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?)
            }
            // VARCHAR, CHAR, TEXT family, ENUM, SET, DECIMAL
            _ => SqlValue::Text(row.try_get::<String, _>(i)?),
        };
        record.set(col.name(), value);
    }
    Ok(record)
}

/// Registry entry for one replicated table.
///
/// Built from configuration at engine construction and never mutated
/// afterwards; every drain, fallback, and provisioning operation takes
/// its table identity from here.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    /// Table name as it exists on both nodes.
    pub name: String,
    /// Integer primary key column.
    pub primary_key: String,
    /// Queue table holding this table's pending change notifications.
    pub queue_table: String,
    /// Sanitised name used as the trigger prefix.
    pub safe_name: String,
    /// Watermark column for the timestamp fallback, if the table has one.
    pub timestamp_column: Option<String>,
}

impl TableSpec {
    /// Create a spec with the default queue table name
    /// (`{safe_name}_sync_queue`) and no watermark column.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let name = name.into();
        let safe_name = safe_table_name(&name);
        let queue_table = format!("{safe_name}_sync_queue");
        Self {
            name,
            primary_key: primary_key.into(),
            queue_table,
            safe_name,
            timestamp_column: None,
        }
    }

    /// Override the queue table name.
    pub fn with_queue_table(mut self, queue_table: impl Into<String>) -> Self {
        self.queue_table = queue_table.into();
        self
    }

    /// Enable the timestamp fallback for this table.
    pub fn with_timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.timestamp_column = Some(column.into());
        self
    }

    /// Trigger name for one operation: `{safe_name}_queue_{op}`.
    pub fn trigger_name(&self, op: &str) -> String {
        format!("{}_queue_{}", self.safe_name, op)
    }

    /// All three trigger names in install order.
    pub fn trigger_names(&self) -> [String; 3] {
        [
            self.trigger_name("insert"),
            self.trigger_name("update"),
            self.trigger_name("delete"),
        ]
    }

    /// Validate every identifier this spec will interpolate into SQL.
    pub fn validate(&self) -> Result<()> {
        for (what, ident) in [
            ("table name", self.name.as_str()),
            ("primary key", self.primary_key.as_str()),
            ("queue table", self.queue_table.as_str()),
        ] {
            if !is_safe_identifier(ident) {
                return Err(SyncError::Config(format!(
                    "invalid {what} `{ident}` for table `{}`",
                    self.name
                )));
            }
        }
        if let Some(col) = &self.timestamp_column {
            if !is_safe_identifier(col) {
                return Err(SyncError::Config(format!(
                    "invalid timestamp column `{col}` for table `{}`",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Sanitise a table name for use in trigger and queue-table identifiers.
///
/// Every character outside `[A-Za-z0-9_]` becomes an underscore, and a
/// leading digit gets a `t_` prefix so the result is always a valid
/// unquoted identifier.
pub fn safe_table_name(name: &str) -> String {
    let mut safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if safe.is_empty() {
        safe.push('t');
    }
    if safe.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        safe.insert_str(0, "t_");
    }
    safe.truncate(MAX_IDENTIFIER_LEN);
    safe
}

/// Check that `ident` can be interpolated into SQL as an unquoted
/// identifier: starts with a letter or underscore, continues with
/// letters, digits, or underscores, and fits MySQL's length limit.
pub fn is_safe_identifier(ident: &str) -> bool {
    if ident.is_empty() || ident.len() > MAX_IDENTIFIER_LEN {
        return false;
    }
    let mut chars = ident.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_table_name_passthrough() {
        assert_eq!(safe_table_name("guests"), "guests");
        assert_eq!(safe_table_name("reservation_items"), "reservation_items");
    }

    #[test]
    fn test_safe_table_name_replaces_punctuation() {
        assert_eq!(safe_table_name("hut.reservations"), "hut_reservations");
        assert_eq!(safe_table_name("room-assignments"), "room_assignments");
        assert_eq!(safe_table_name("weird table!"), "weird_table_");
    }

    #[test]
    fn test_safe_table_name_leading_digit() {
        assert_eq!(safe_table_name("2024_bookings"), "t_2024_bookings");
    }

    #[test]
    fn test_safe_table_name_empty() {
        assert_eq!(safe_table_name(""), "t");
    }

    #[test]
    fn test_safe_table_name_truncates() {
        let long = "x".repeat(200);
        assert_eq!(safe_table_name(&long).len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_is_safe_identifier() {
        assert!(is_safe_identifier("guests"));
        assert!(is_safe_identifier("_internal"));
        assert!(is_safe_identifier("col2"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("2col"));
        assert!(!is_safe_identifier("drop table"));
        assert!(!is_safe_identifier("a;--"));
        assert!(!is_safe_identifier(&"x".repeat(65)));
    }

    #[test]
    fn test_trigger_names() {
        let spec = TableSpec::new("guests", "id");
        assert_eq!(spec.trigger_name("insert"), "guests_queue_insert");
        assert_eq!(spec.trigger_name("update"), "guests_queue_update");
        assert_eq!(spec.trigger_name("delete"), "guests_queue_delete");
    }

    #[test]
    fn test_default_queue_table_name() {
        let spec = TableSpec::new("reservations", "id");
        assert_eq!(spec.queue_table, "reservations_sync_queue");
    }

    #[test]
    fn test_spec_builders() {
        let spec = TableSpec::new("guests", "id")
            .with_queue_table("guests_q")
            .with_timestamp_column("sync_timestamp");
        assert_eq!(spec.queue_table, "guests_q");
        assert_eq!(spec.timestamp_column.as_deref(), Some("sync_timestamp"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_validation_rejects_injection() {
        let spec = TableSpec::new("guests", "id; DROP TABLE guests");
        assert!(spec.validate().is_err());

        let spec = TableSpec::new("guests", "id").with_queue_table("q;--");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_record_id_extraction() {
        let mut record = Record::new();
        record.set("id", SqlValue::Int(42));
        record.set("remark", SqlValue::Text("X".to_string()));
        assert_eq!(record.id("id"), Some(42));
        assert_eq!(record.id("missing"), None);

        let mut unsigned = Record::new();
        unsigned.set("id", SqlValue::UInt(7));
        assert_eq!(unsigned.id("id"), Some(7));

        let mut text_pk = Record::new();
        text_pk.set("id", SqlValue::Text("42".to_string()));
        assert_eq!(text_pk.id("id"), None);
    }

    #[test]
    fn test_record_column_order_is_deterministic() {
        let mut record = Record::new();
        record.set("zeta", SqlValue::Int(1));
        record.set("alpha", SqlValue::Int(2));
        record.set("mid", SqlValue::Int(3));
        let names: Vec<&str> = record.column_names().collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_record_json_snapshot() {
        let mut record = Record::new();
        record.set("id", SqlValue::Int(42));
        record.set("remark", SqlValue::Text("X".to_string()));
        record.set("deleted_at", SqlValue::Null);
        let json: serde_json::Value =
            serde_json::from_str(&record.to_json_string()).expect("valid json");
        assert_eq!(json["id"], 42);
        assert_eq!(json["remark"], "X");
        assert!(json["deleted_at"].is_null());
    }

    #[test]
    fn test_value_as_datetime() {
        let ts = NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(9, 26, 53)
            .unwrap();
        assert_eq!(SqlValue::DateTime(ts).as_datetime(), Some(ts));
        assert_eq!(SqlValue::Int(0).as_datetime(), None);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(SqlValue::Null.to_string(), "NULL");
        assert_eq!(SqlValue::Int(-3).to_string(), "-3");
        assert_eq!(SqlValue::Bytes(vec![1, 2, 3]).to_string(), "<3 bytes>");
    }
}
