//! Fuzz target for queue label parsing.
//!
//! This tests that operation and status parsing never panic on arbitrary
//! input and that recognised labels round-trip.

#![no_main]

use duplex_sync::{QueueOp, QueueStatus};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|label: &str| {
    // Should never panic
    if let Some(op) = QueueOp::from_str(label) {
        // Anything that parses must round-trip through its canonical label
        assert_eq!(QueueOp::from_str(op.as_str()), Some(op));
        assert!(label.eq_ignore_ascii_case(op.as_str()));
    }

    if let Some(status) = QueueStatus::from_str(label) {
        assert_eq!(QueueStatus::from_str(status.as_str()), Some(status));
        assert!(label.eq_ignore_ascii_case(status.as_str()));
    }
});
