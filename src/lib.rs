//! # Duplex Sync
//!
//! A bidirectional synchronization engine for a pair of independently
//! writable MySQL nodes. Either node takes user writes directly; no
//! node is a fixed master. The engine keeps a configured set of tables
//! eventually consistent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             duplex-sync                              │
//! │                                                                      │
//! │   local node                                       remote node       │
//! │  ┌──────────┐  triggers   ┌───────────┐  suppressed ┌──────────┐     │
//! │  │ tables   │────────────►│ queue     │  writes     │ tables   │     │
//! │  │          │             │ tables    │────────────►│          │     │
//! │  └──────────┘             └───────────┘             └──────────┘     │
//! │       ▲                                                  │           │
//! │       │             (and the mirror image                │ triggers  │
//! │       └──────────────  remote → local)  ◄────────────────┘           │
//! │                                                                      │
//! │  ┌────────────────────────────┐  ┌───────────────────────────────┐   │
//! │  │ SyncEngine::sync()         │  │ SyncEngine::force_sync_latest │   │
//! │  │ (queue drain, primary)     │  │ (timestamp fallback, repair)  │   │
//! │  └────────────────────────────┘  └───────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Synchronization
//!
//! 1. **Queue drain (primary)**: database triggers capture row changes
//!    into per-table queue tables; `sync()` claims batches, re-reads
//!    current source rows, and replays them on the peer under a
//!    suppression sentinel so the engine's own writes never re-queue.
//! 2. **Timestamp fallback (repair)**: `force_sync_latest()` scans
//!    `sync_timestamp` watermarks over a window and copies rows the
//!    queue path missed (bulk imports, dropped triggers, lost queues).
//!
//! The engine owns no scheduler: each call runs one bounded pass in the
//! caller's task and returns a [`SyncReport`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use duplex_sync::{SyncConfig, SyncEngine, TableConfig};
//!
//! #[tokio::main]
//! async fn main() -> duplex_sync::Result<()> {
//!     let mut config = SyncConfig::default();
//!     config.local.url = "mysql://hut@10.0.0.5/hotel".into();
//!     config.remote.url = "mysql://hut@db.example.net/hotel".into();
//!     config.tables = vec![
//!         TableConfig::new("reservations"),
//!         TableConfig::new("guests"),
//!     ];
//!
//!     let engine = SyncEngine::new(config)?;
//!     let report = engine.sync("cron").await;
//!     println!("{}", serde_json::to_string_pretty(&report).unwrap());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod provision;
pub mod queue;
pub mod record;
pub mod resilience;
pub mod store;
pub mod suppress;

// Re-exports for convenience
pub use config::{ConnectConfig, DrainConfig, FallbackConfig, NodeConfig, SyncConfig, TableConfig};
pub use engine::{
    Direction, DirectionReport, QueueStatusReport, SyncEngine, SyncReport, TableQueueStatus,
    TableReport,
};
pub use error::{Result, SyncError};
pub use queue::{QueueDepth, QueueEntry, QueueOp, QueueStatus};
pub use record::{Record, SqlValue, TableSpec};
pub use resilience::RetryConfig;
pub use store::{MemoryNode, MySqlNode, SyncStore, WatermarkProbe};
