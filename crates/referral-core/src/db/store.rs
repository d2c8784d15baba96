//! Closure store: row-level access to the referral tables.
//!
//! Provides typed structs and plain query functions for the two tables the
//! engine maintains: the `referral_members` adjacency list and the bounded
//! `referral_closure` ancestor index. Nothing here decides consistency; every
//! function executes inside whatever transaction the caller opened on `conn`.
//!
//! Uniqueness and primary-key violations are surfaced as
//! [`StoreError::UniqueViolation`] so the engine can report them apart from
//! other SQLite failures.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Type};
use serde::Serialize;
use std::collections::HashMap;

/// Deepest ancestor level materialized in `referral_closure`.
pub const MAX_CLOSURE_LEVEL: u8 = 3;

const CLOSURE_COLUMNS: &str = "root_user_id, referred_user_id, level, parent_user_id, \
     commission_percent, is_active, created_at_us, created_by, updated_at_us, updated_by";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One materialized (ancestor, descendant, distance) record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosureRow {
    /// Ancestor of `referred_user_id`, `level` steps up.
    pub root_user_id: String,
    pub referred_user_id: String,
    /// Distance from `root_user_id` to `referred_user_id`, in `1..=3`.
    pub level: u8,
    /// Immediate upline of `referred_user_id`; identical on all of its rows.
    pub parent_user_id: String,
    pub commission_percent: f64,
    pub is_active: bool,
    pub created_at_us: i64,
    pub created_by: Option<String>,
    pub updated_at_us: i64,
    pub updated_by: Option<String>,
}

/// A registered user and its immediate upline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberRecord {
    pub user_id: String,
    pub parent_user_id: Option<String>,
    pub joined_at_us: i64,
    pub updated_at_us: i64,
}

/// Errors from closure store reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A `UNIQUE` or primary-key constraint rejected the write.
    #[error("unique constraint violated for '{referred_user_id}': {detail}")]
    UniqueViolation {
        referred_user_id: String,
        detail: String,
    },

    /// The caller handed over rows that do not belong to the target user.
    #[error("invalid closure row: {0}")]
    InvalidRow(String),

    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        classify(err, "")
    }
}

fn classify(err: rusqlite::Error, referred_user_id: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &err {
        let unique = failure.code == rusqlite::ErrorCode::ConstraintViolation
            && matches!(
                failure.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            );
        if unique {
            return StoreError::UniqueViolation {
                referred_user_id: referred_user_id.to_string(),
                detail: message.clone().unwrap_or_else(|| failure.to_string()),
            };
        }
    }
    StoreError::Sqlite(err)
}

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn closure_row_from_row(row: &Row<'_>) -> rusqlite::Result<ClosureRow> {
    let level: i64 = row.get(2)?;
    let level = u8::try_from(level)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Integer, Box::new(e)))?;
    Ok(ClosureRow {
        root_user_id: row.get(0)?,
        referred_user_id: row.get(1)?,
        level,
        parent_user_id: row.get(3)?,
        commission_percent: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        created_at_us: row.get(6)?,
        created_by: row.get(7)?,
        updated_at_us: row.get(8)?,
        updated_by: row.get(9)?,
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<MemberRecord> {
    Ok(MemberRecord {
        user_id: row.get(0)?,
        parent_user_id: row.get(1)?,
        joined_at_us: row.get(2)?,
        updated_at_us: row.get(3)?,
    })
}

// ---------------------------------------------------------------------------
// Closure rows
// ---------------------------------------------------------------------------

/// All materialized ancestors of `referred_user_id`, nearest first.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn get_ancestor_rows(
    conn: &Connection,
    referred_user_id: &str,
) -> Result<Vec<ClosureRow>, StoreError> {
    let sql = format!(
        "SELECT {CLOSURE_COLUMNS} FROM referral_closure \
         WHERE referred_user_id = ?1 ORDER BY level ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![referred_user_id], closure_row_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rows naming `root_user_id` as ancestor, ordered by level then user.
///
/// `Some(level)` limits the result to levels `1..=level`; `None` returns
/// every materialized level.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn get_descendant_rows(
    conn: &Connection,
    root_user_id: &str,
    level: Option<u8>,
) -> Result<Vec<ClosureRow>, StoreError> {
    let max_level = level.unwrap_or(MAX_CLOSURE_LEVEL);
    let sql = format!(
        "SELECT {CLOSURE_COLUMNS} FROM referral_closure \
         WHERE root_user_id = ?1 AND level <= ?2 \
         ORDER BY level ASC, referred_user_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![root_user_id, i64::from(max_level)],
            closure_row_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Level-1 rows of every user directly under `parent_user_id`.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn get_by_parent(
    conn: &Connection,
    parent_user_id: &str,
) -> Result<Vec<ClosureRow>, StoreError> {
    let sql = format!(
        "SELECT {CLOSURE_COLUMNS} FROM referral_closure \
         WHERE parent_user_id = ?1 AND level = 1 \
         ORDER BY referred_user_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![parent_user_id], closure_row_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every closure row, ordered by descendant then level.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn list_all_rows(conn: &Connection) -> Result<Vec<ClosureRow>, StoreError> {
    let sql = format!(
        "SELECT {CLOSURE_COLUMNS} FROM referral_closure \
         ORDER BY referred_user_id ASC, level ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], closure_row_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Replace the full row set of `referred_user_id`: delete, then insert `rows`.
///
/// Passing an empty slice leaves the user with no ancestors.
///
/// # Errors
///
/// Returns [`StoreError::InvalidRow`] if a row belongs to a different user,
/// [`StoreError::UniqueViolation`] if the insert hits the
/// `(referred_user_id, level)` constraint, or [`StoreError::Sqlite`].
pub fn replace_rows_for_user(
    conn: &Connection,
    referred_user_id: &str,
    rows: &[ClosureRow],
) -> Result<(), StoreError> {
    if let Some(stray) = rows.iter().find(|r| r.referred_user_id != referred_user_id) {
        return Err(StoreError::InvalidRow(format!(
            "row for '{}' passed while replacing '{referred_user_id}'",
            stray.referred_user_id
        )));
    }

    delete_rows_for_user(conn, referred_user_id)?;

    let sql = format!(
        "INSERT INTO referral_closure ({CLOSURE_COLUMNS}) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    for row in rows {
        stmt.execute(params![
            row.root_user_id,
            row.referred_user_id,
            i64::from(row.level),
            row.parent_user_id,
            row.commission_percent,
            i64::from(row.is_active),
            row.created_at_us,
            row.created_by,
            row.updated_at_us,
            row.updated_by,
        ])
        .map_err(|e| classify(e, referred_user_id))?;
    }
    Ok(())
}

/// Delete every row describing `referred_user_id`'s ancestors.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the delete fails.
pub fn delete_rows_for_user(conn: &Connection, referred_user_id: &str) -> Result<usize, StoreError> {
    let deleted = conn
        .prepare_cached("DELETE FROM referral_closure WHERE referred_user_id = ?1")?
        .execute(params![referred_user_id])?;
    Ok(deleted)
}

/// Delete the entire closure index.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the delete fails.
pub fn delete_all_rows(conn: &Connection) -> Result<usize, StoreError> {
    Ok(conn.execute("DELETE FROM referral_closure", [])?)
}

/// Number of direct referrals (level-1 rows) under each of `user_ids`.
///
/// Users without referrals map to zero.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn count_direct_referrals(
    conn: &Connection,
    user_ids: &[String],
) -> Result<HashMap<String, usize>, StoreError> {
    let mut counts: HashMap<String, usize> =
        user_ids.iter().map(|id| (id.clone(), 0)).collect();

    // Stay well below SQLITE_MAX_VARIABLE_NUMBER.
    for chunk in user_ids.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT root_user_id, COUNT(*) FROM referral_closure \
             WHERE level = 1 AND root_user_id IN ({placeholders}) \
             GROUP BY root_user_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (user_id, count) = row?;
            counts.insert(user_id, usize::try_from(count).unwrap_or(0));
        }
    }
    Ok(counts)
}

// ---------------------------------------------------------------------------
// Members (adjacency)
// ---------------------------------------------------------------------------

/// Look up a registered user.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn get_member(conn: &Connection, user_id: &str) -> Result<Option<MemberRecord>, StoreError> {
    let member = conn
        .prepare_cached(
            "SELECT user_id, parent_user_id, joined_at_us, updated_at_us \
             FROM referral_members WHERE user_id = ?1",
        )?
        .query_row(params![user_id], member_from_row)
        .optional()?;
    Ok(member)
}

/// Register `user_id` with the given upline. Returns `false` if the user was
/// already registered (the existing record is left untouched).
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the insert fails, e.g. when
/// `parent_user_id` is not registered or `user_id` is blank.
pub fn insert_member(
    conn: &Connection,
    user_id: &str,
    parent_user_id: Option<&str>,
) -> Result<bool, StoreError> {
    let now = now_us();
    let inserted = conn
        .prepare_cached(
            "INSERT INTO referral_members \
             (user_id, parent_user_id, joined_at_us, updated_at_us) \
             VALUES (?1, ?2, ?3, ?3) \
             ON CONFLICT(user_id) DO NOTHING",
        )?
        .execute(params![user_id, parent_user_id, now])?;
    Ok(inserted > 0)
}

/// Point `user_id` at a new upline (or none). Returns `false` if the user is
/// not registered.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the update fails.
pub fn set_parent(
    conn: &Connection,
    user_id: &str,
    parent_user_id: Option<&str>,
) -> Result<bool, StoreError> {
    let updated = conn
        .prepare_cached(
            "UPDATE referral_members SET parent_user_id = ?2, updated_at_us = ?3 \
             WHERE user_id = ?1",
        )?
        .execute(params![user_id, parent_user_id, now_us()])?;
    Ok(updated > 0)
}

/// Remove a user's membership record. Returns `false` if it did not exist.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the delete fails, including when other
/// members still name `user_id` as their upline.
pub fn delete_member(conn: &Connection, user_id: &str) -> Result<bool, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM referral_members WHERE user_id = ?1",
        params![user_id],
    )?;
    Ok(deleted > 0)
}

/// Ids of the users directly under `parent_user_id`, sorted.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn get_children(conn: &Connection, parent_user_id: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id FROM referral_members \
         WHERE parent_user_id = ?1 ORDER BY user_id ASC",
    )?;
    let ids = stmt
        .query_map(params![parent_user_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Every registered user, sorted by id.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn list_members(conn: &Connection) -> Result<Vec<MemberRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT user_id, parent_user_id, joined_at_us, updated_at_us \
         FROM referral_members ORDER BY user_id ASC",
    )?;
    let members = stmt
        .query_map([], member_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

/// Record the time of the last full closure rebuild.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the update fails.
pub fn mark_rebuilt(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE referral_meta SET last_rebuild_at_us = ?1 WHERE id = 1",
        params![now_us()],
    )?;
    Ok(())
}

/// Time of the last full closure rebuild, `None` if the index was never
/// rebuilt.
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if the query fails.
pub fn last_rebuilt_at(conn: &Connection) -> Result<Option<i64>, StoreError> {
    let at: i64 = conn.query_row(
        "SELECT last_rebuild_at_us FROM referral_meta WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok((at > 0).then_some(at))
}
