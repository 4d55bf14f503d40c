//! Fuzz target for old-row JSON snapshots.
//!
//! This tests that a record built from arbitrary column names and values
//! always serialises to parseable JSON carrying every column.

#![no_main]

use duplex_sync::{Record, SqlValue};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (Vec<(String, i64)>, String)| {
    let (columns, text) = data;

    let mut record = Record::new();
    for (name, value) in columns {
        record.set(name, SqlValue::Int(value));
    }
    record.set("remark", SqlValue::Text(text));

    // Should never panic, and must always be valid JSON
    let snapshot = record.to_json_string();
    let json: serde_json::Value = serde_json::from_str(&snapshot).expect("snapshot must parse");

    let object = json.as_object().expect("snapshot must be an object");
    assert_eq!(object.len(), record.len());
});
