//! SQLite referral store utilities.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so tree projections keep reading the last committed
//!   state while a mutation holds the write lock
//! - `busy_timeout = 5s` so a second mutation waits for the first instead of
//!   failing immediately
//! - `foreign_keys = ON` so an upline must be a registered member

pub mod migrations;
pub mod schema;
pub mod scope;
pub mod store;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{path::Path, time::Duration};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the referral store, apply runtime pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
pub fn open_store(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("open referral store {}", path.display()))?;

    configure_connection(&conn, busy_timeout).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply referral store migrations")?;

    tracing::debug!(path = %path.display(), "opened referral store");
    Ok(conn)
}

/// Open a private in-memory store with the full schema.
///
/// # Errors
///
/// Returns an error if configuring or migrating the database fails.
pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().context("open in-memory referral store")?;
    configure_connection(&conn, DEFAULT_BUSY_TIMEOUT).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply referral store migrations")?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}
