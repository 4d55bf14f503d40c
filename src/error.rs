// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! This module defines the error types used throughout the engine. Errors
//! are categorized by where they occur (node connectivity, destination
//! apply, provisioning preconditions) and include context to help with
//! debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connectivity` | Yes | Pool/network failures reaching a node; aborts the direction |
//! | `Apply` | Yes | Destination write rejected; retried until the entry's budget |
//! | `Database` | Maybe | Transient server errors (deadlock, lock wait) retry |
//! | `WatermarkMissing` | No | Table lacks the fallback watermark column |
//! | `QueueTableMissing` | No | Queue table not provisioned on a node |
//! | `Config` | No | Table registry or node URL invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to determine if an operation should be
//! retried. A failed apply counts against the queue entry's retry budget;
//! the entry stays `pending` while retryable and flips to `failed` once the
//! budget is exhausted. Use [`SyncError::is_connectivity()`] to decide
//! whether to abort the remaining batch for a table: connectivity failures
//! abort, per-entry failures do not.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried, and [`is_connectivity()`](Self::is_connectivity)
/// to check whether the current direction should be abandoned.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Node unreachable or connection lost.
    ///
    /// Occurs when acquiring a connection or mid-statement when the
    /// server goes away. Aborts the remaining batch for the current
    /// table and direction; other tables and the opposite direction
    /// continue. Retryable on the next invocation.
    #[error("Connectivity error ({node}): {message}")]
    Connectivity {
        node: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Destination rejected an engine-initiated write.
    ///
    /// Constraint or validation failure (NOT NULL, length overflow,
    /// schema drift) while replacing or deleting a row. Caught per
    /// entry; the entry is retried until its budget is exhausted and
    /// then marked `failed` for manual remediation.
    #[error("Apply error on {table} id {record_id}: {message}")]
    Apply {
        table: String,
        record_id: i64,
        message: String,
    },

    /// Fallback watermark column missing from a node's table.
    ///
    /// The timestamp fallback refuses to run for a table when either
    /// node lacks the configured watermark column, rather than silently
    /// reconciling nothing. Not retryable until the schema is fixed.
    #[error("Watermark column `{column}` missing on {node} table `{table}`")]
    WatermarkMissing {
        node: String,
        table: String,
        column: String,
    },

    /// Queue table absent on a node.
    ///
    /// Drain precondition violated; run provisioning. Not retryable
    /// until the queue table exists.
    #[error("Queue table `{queue_table}` missing on {node}")]
    QueueTableMissing { node: String, queue_table: String },

    /// Invalid or missing configuration.
    ///
    /// Occurs during engine construction if the table registry or node
    /// settings are malformed. Not retryable; fix the configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error not classified above.
    ///
    /// Retryable only for known-transient server conditions (deadlock,
    /// lock wait timeout).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    /// Not retryable; indicates a bug that needs investigation.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// MySQL server error numbers treated as connectivity loss.
///
/// 1040 = too many connections, 1053 = server shutdown in progress,
/// 1077 = normal shutdown, 1081 = can't create IP socket.
const MYSQL_CONNECTIVITY_CODES: &[u32] = &[1040, 1053, 1077, 1081];

/// MySQL server error numbers that are transient and worth retrying
/// without counting as connectivity loss.
///
/// 1205 = lock wait timeout, 1213 = deadlock found.
const MYSQL_TRANSIENT_CODES: &[u32] = &[1205, 1213];

impl SyncError {
    /// Create a connectivity error from an underlying sqlx error.
    pub fn connectivity(node: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Connectivity {
            node: node.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a connectivity error without a source.
    pub fn connectivity_msg(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            node: node.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a per-entry apply error from a destination write failure.
    pub fn apply(table: impl Into<String>, record_id: i64, source: &sqlx::Error) -> Self {
        Self::Apply {
            table: table.into(),
            record_id,
            message: source.to_string(),
        }
    }

    /// Classify an sqlx error raised while talking to `node`.
    ///
    /// Transport failures (IO, TLS, protocol, pool exhaustion) and
    /// server-gone error codes become [`SyncError::Connectivity`];
    /// everything else passes through as [`SyncError::Database`].
    pub fn from_db(node: &str, e: sqlx::Error) -> Self {
        if sqlx_is_connectivity(&e) {
            Self::connectivity(node, e)
        } else {
            Self::Database(e)
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity { .. } => true, // Network errors are retryable
            Self::Apply { .. } => true,        // Until the entry's budget runs out
            Self::Database(e) => sqlx_is_transient(e),
            Self::WatermarkMissing { .. } => false, // Schema needs attention
            Self::QueueTableMissing { .. } => false, // Provisioning needs to run
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error means the node itself is unreachable.
    ///
    /// Connectivity failures abort the remaining batch for the current
    /// table; per-entry failures do not.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::QueueTableMissing { .. }
        )
    }
}

fn mysql_error_number(e: &sqlx::Error) -> Option<u32> {
    e.as_database_error()
        .and_then(|d| d.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>())
        .map(|m| u32::from(m.number()))
}

fn sqlx_is_connectivity(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(_) => {
            mysql_error_number(e).is_some_and(|n| MYSQL_CONNECTIVITY_CODES.contains(&n))
        }
        _ => false,
    }
}

fn sqlx_is_transient(e: &sqlx::Error) -> bool {
    mysql_error_number(e).is_some_and(|n| MYSQL_TRANSIENT_CODES.contains(&n))
}
