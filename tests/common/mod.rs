//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - MySQL testcontainer setup
//! - Hotel schema fixtures and direct-SQL helpers

use std::sync::Once;

pub mod containers;

pub use containers::*;

static TRACING: Once = Once::new();

/// Route engine logs to the test output, honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}
