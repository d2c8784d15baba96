//! All-or-nothing write scope for structural mutations.
//!
//! A top-level scope issues `BEGIN IMMEDIATE`, which takes SQLite's reserved
//! write lock up front: two mutations over overlapping subtrees can never
//! interleave their read-then-rewrite phases, and the lock is held by the
//! store itself rather than by the process. Readers keep working against the
//! last committed state under WAL.
//!
//! When the caller already opened a transaction on the connection, the scope
//! nests as a `SAVEPOINT` inside it so the mutation joins the caller's
//! boundary.
//!
//! Dropping a scope that was not committed rolls it back.
//!
//! [`ReadScope`] is the read-side counterpart: a deferred transaction whose
//! snapshot is fixed by its first statement, so a read made of several
//! queries never mixes two committed states.

use rusqlite::Connection;
use tracing::warn;

const SAVEPOINT_NAME: &str = "referral_mutation";
const READ_SAVEPOINT_NAME: &str = "referral_read";

/// Guard over one atomic unit of closure/adjacency writes.
pub struct WriteScope<'conn> {
    conn: &'conn Connection,
    nested: bool,
    finished: bool,
}

impl<'conn> WriteScope<'conn> {
    /// Open a scope on `conn`.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite refuses the `BEGIN` (e.g. the write lock is
    /// still held by another connection after the busy timeout).
    pub fn begin(conn: &'conn Connection) -> rusqlite::Result<Self> {
        let nested = !conn.is_autocommit();
        if nested {
            conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT_NAME}"))?;
        } else {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(Self {
            conn,
            nested,
            finished: false,
        })
    }

    /// The connection writes should go through.
    #[must_use]
    pub const fn conn(&self) -> &'conn Connection {
        self.conn
    }

    /// Whether this scope joined a transaction opened by the caller.
    #[must_use]
    pub const fn is_nested(&self) -> bool {
        self.nested
    }

    /// Make every write in the scope visible at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the scope is then rolled back on
    /// drop.
    pub fn commit(mut self) -> rusqlite::Result<()> {
        if self.nested {
            self.conn
                .execute_batch(&format!("RELEASE SAVEPOINT {SAVEPOINT_NAME}"))?;
        } else {
            self.conn.execute_batch("COMMIT")?;
        }
        self.finished = true;
        Ok(())
    }

    fn rollback(&self) -> rusqlite::Result<()> {
        if self.nested {
            self.conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {SAVEPOINT_NAME}; RELEASE SAVEPOINT {SAVEPOINT_NAME}"
            ))
        } else {
            self.conn.execute_batch("ROLLBACK")
        }
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.rollback() {
            warn!("failed to roll back referral mutation: {e}");
        } else {
            warn!(nested = self.nested, "rolled back referral mutation");
        }
    }
}

/// Guard holding one consistent snapshot across several queries.
pub struct ReadScope<'conn> {
    conn: &'conn Connection,
    nested: bool,
    finished: bool,
}

impl<'conn> ReadScope<'conn> {
    /// Open a snapshot on `conn`, or join the transaction already open on it.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite refuses the `BEGIN`.
    pub fn begin(conn: &'conn Connection) -> rusqlite::Result<Self> {
        let nested = !conn.is_autocommit();
        if nested {
            conn.execute_batch(&format!("SAVEPOINT {READ_SAVEPOINT_NAME}"))?;
        } else {
            conn.execute_batch("BEGIN DEFERRED")?;
        }
        Ok(Self {
            conn,
            nested,
            finished: false,
        })
    }

    #[must_use]
    pub const fn conn(&self) -> &'conn Connection {
        self.conn
    }

    /// Release the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite refuses the `COMMIT`/`RELEASE`.
    pub fn finish(mut self) -> rusqlite::Result<()> {
        if self.nested {
            self.conn
                .execute_batch(&format!("RELEASE SAVEPOINT {READ_SAVEPOINT_NAME}"))?;
        } else {
            self.conn.execute_batch("COMMIT")?;
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for ReadScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let result = if self.nested {
            self.conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {READ_SAVEPOINT_NAME}; RELEASE SAVEPOINT {READ_SAVEPOINT_NAME}"
            ))
        } else {
            self.conn.execute_batch("ROLLBACK")
        };
        if let Err(e) = result {
            warn!("failed to release referral read snapshot: {e}");
        }
    }
}
