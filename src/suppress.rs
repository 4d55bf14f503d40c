//! Connection-scoped trigger suppression.
//!
//! Every capture trigger checks the session variable `@sync_in_progress`
//! before enqueueing, so the engine's own peer writes must run on a
//! connection with the sentinel set and must never leak that connection
//! back to the pool still flagged. A stuck flag is not a crash, it is a
//! silent capture outage for whatever writes later share the session.
//!
//! # State machine (per connection)
//!
//! ```text
//! inactive --set--> active --clear--> inactive
//! ```
//!
//! [`with_suppression`] owns the full cycle: it sets the sentinel, runs
//! the write closure, and always attempts the clear before returning the
//! closure's result. If the clear fails on a live connection, the
//! connection is detached from the pool and closed instead of reused.

use futures::future::BoxFuture;
use sqlx::mysql::{MySql, MySqlConnection};
use sqlx::pool::PoolConnection;
use tracing::warn;

use crate::error::Result;

/// Session variable checked by every capture trigger.
pub const SENTINEL_VAR: &str = "@sync_in_progress";

/// Statement that activates suppression for the session.
pub const SET_SQL: &str = "SET @sync_in_progress = 1";

/// Statement that deactivates suppression for the session.
pub const CLEAR_SQL: &str = "SET @sync_in_progress = NULL";

/// Set the sentinel on this connection.
pub async fn set(conn: &mut MySqlConnection) -> Result<()> {
    sqlx::query(SET_SQL).execute(&mut *conn).await?;
    Ok(())
}

/// Clear the sentinel on this connection.
pub async fn clear(conn: &mut MySqlConnection) -> Result<()> {
    sqlx::query(CLEAR_SQL).execute(&mut *conn).await?;
    Ok(())
}

/// Run `f` with suppression active on a pooled connection.
///
/// The connection is consumed: on the normal path it returns to the pool
/// with the sentinel cleared; if the clear fails, the connection is
/// detached and closed so the pool can never hand out a session that
/// still has the flag set.
///
/// The closure's own failure does not skip the clear. If both the
/// closure and the clear fail, the closure's error wins (the clear
/// failure is logged).
pub async fn with_suppression<T, F>(mut conn: PoolConnection<MySql>, f: F) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T>>,
{
    set(conn.as_mut()).await?;
    let result = f(conn.as_mut()).await;
    if let Err(clear_err) = clear(conn.as_mut()).await {
        warn!(
            error = %clear_err,
            "failed to clear suppression sentinel; closing connection"
        );
        let raw = conn.detach();
        let _ = sqlx::Connection::close(raw).await;
        // A successful write on a session we had to kill still reports the
        // clear failure; replaying the entry later is safe.
        return result.and(Err(clear_err));
    }
    result
}
