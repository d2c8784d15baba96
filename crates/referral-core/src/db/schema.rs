//! Canonical SQLite schema for the referral store.
//!
//! Two related structures are kept side by side:
//! - `referral_members` is the authoritative adjacency list: every registered
//!   user and its immediate upline, with no depth limit
//! - `referral_closure` materializes the three nearest ancestors of every
//!   placed user for shallow lookups; it is derived from `referral_members`
//!   and can be rebuilt from it
//!
//! `referral_meta` tracks the schema version.

/// Migration v1: adjacency, closure index, and metadata tables.
pub const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS referral_members (
    user_id TEXT PRIMARY KEY CHECK (length(trim(user_id)) > 0),
    parent_user_id TEXT REFERENCES referral_members(user_id),
    joined_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    CHECK (parent_user_id IS NULL OR parent_user_id <> user_id)
);

CREATE TABLE IF NOT EXISTS referral_closure (
    closure_id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_user_id TEXT NOT NULL,
    referred_user_id TEXT NOT NULL,
    level INTEGER NOT NULL CHECK (level BETWEEN 1 AND 3),
    parent_user_id TEXT NOT NULL,
    commission_percent REAL NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
    created_at_us INTEGER NOT NULL,
    created_by TEXT,
    updated_at_us INTEGER NOT NULL,
    updated_by TEXT,
    UNIQUE (referred_user_id, level),
    CHECK (root_user_id <> referred_user_id),
    CHECK (level <> 1 OR root_user_id = parent_user_id)
);

CREATE TABLE IF NOT EXISTS referral_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_rebuild_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO referral_meta (id, schema_version, last_rebuild_at_us)
VALUES (1, 1, 0);
"#;

/// Migration v2: read-path indexes for subtree, parent, and projection queries.
pub const MIGRATION_V2_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_referral_members_parent
    ON referral_members(parent_user_id, user_id);

CREATE INDEX IF NOT EXISTS idx_referral_closure_root_level
    ON referral_closure(root_user_id, level, referred_user_id);

CREATE INDEX IF NOT EXISTS idx_referral_closure_parent
    ON referral_closure(parent_user_id);

UPDATE referral_meta
SET schema_version = 2
WHERE id = 1;
"#;

/// Indexes expected by traversal and projection query paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_referral_members_parent",
    "idx_referral_closure_root_level",
    "idx_referral_closure_parent",
];
