//! Fuzz target for table name sanitisation.
//!
//! This tests that `safe_table_name` never panics on arbitrary input,
//! always produces an interpolation-safe identifier, and is idempotent.

#![no_main]

use duplex_sync::record::{is_safe_identifier, safe_table_name};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|name: &str| {
    // Should never panic
    let safe = safe_table_name(name);

    // The output must always be safe to splice into DDL unquoted
    assert!(is_safe_identifier(&safe), "unsafe output: {safe:?}");

    // Sanitising twice changes nothing
    assert_eq!(safe_table_name(&safe), safe);
});
