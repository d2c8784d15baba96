//! Consistency check between the adjacency list and the closure index.
//!
//! Re-derives the rows every member should have from `referral_members` and
//! compares them with what `referral_closure` holds. Used after bulk imports,
//! by `refer verify`, and throughout the test suite as the oracle for the
//! closure invariants.

#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::db::scope::ReadScope;
use crate::db::store::{self, ClosureRow};
use crate::error::HierarchyError;
use crate::graph::engine::chain_from_parents;

/// One broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// The ancestor at `level` is not materialized.
    MissingRow {
        user_id: String,
        level: u8,
        expected_root: String,
    },
    /// The row at `level` names the wrong ancestor.
    WrongRoot {
        user_id: String,
        level: u8,
        expected_root: String,
        actual_root: String,
    },
    /// A row exists beyond the user's real ancestor chain.
    ExtraRow {
        user_id: String,
        level: u8,
        root: String,
    },
    /// A row's denormalized parent differs from the real upline.
    ParentMismatch {
        user_id: String,
        level: u8,
        expected_parent: Option<String>,
        actual_parent: String,
    },
    /// A row refers to a user that is not registered.
    UnknownUser { user_id: String },
    /// Following uplines from `user_id` never reaches a root.
    AdjacencyCycle { user_id: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRow {
                user_id,
                level,
                expected_root,
            } => write!(f, "'{user_id}' is missing level {level} row for '{expected_root}'"),
            Self::WrongRoot {
                user_id,
                level,
                expected_root,
                actual_root,
            } => write!(
                f,
                "'{user_id}' level {level} names '{actual_root}', expected '{expected_root}'"
            ),
            Self::ExtraRow {
                user_id,
                level,
                root,
            } => write!(f, "'{user_id}' has stray level {level} row for '{root}'"),
            Self::ParentMismatch {
                user_id,
                level,
                expected_parent,
                actual_parent,
            } => write!(
                f,
                "'{user_id}' level {level} carries parent '{actual_parent}', expected '{}'",
                expected_parent.as_deref().unwrap_or("<none>")
            ),
            Self::UnknownUser { user_id } => write!(f, "closure references unknown user '{user_id}'"),
            Self::AdjacencyCycle { user_id } => write!(f, "upline of '{user_id}' loops"),
        }
    }
}

/// Result of [`verify_closure`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub members: usize,
    pub rows: usize,
    /// Time of the last full rebuild, `None` if the index was never rebuilt.
    pub last_rebuild_at_us: Option<i64>,
    pub violations: Vec<Violation>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Compare the closure index against the adjacency list.
///
/// # Errors
///
/// Returns [`HierarchyError::Db`] for database failures. Inconsistencies are
/// reported in the returned [`VerifyReport`], not as errors.
pub fn verify_closure(conn: &Connection) -> Result<VerifyReport, HierarchyError> {
    let scope = ReadScope::begin(conn)?;
    let members = store::list_members(scope.conn())?;
    let rows = store::list_all_rows(scope.conn())?;
    let last_rebuild_at_us = store::last_rebuilt_at(scope.conn())?;
    scope.finish()?;

    let parents: HashMap<String, Option<String>> = members
        .iter()
        .map(|m| (m.user_id.clone(), m.parent_user_id.clone()))
        .collect();

    let mut by_user: BTreeMap<&str, Vec<&ClosureRow>> = BTreeMap::new();
    for row in &rows {
        by_user.entry(&row.referred_user_id).or_default().push(row);
    }

    let mut violations = Vec::new();
    let cyclic = find_cyclic(&parents);
    for user_id in &cyclic {
        violations.push(Violation::AdjacencyCycle {
            user_id: user_id.clone(),
        });
    }

    for row in &rows {
        for id in [&row.referred_user_id, &row.root_user_id] {
            if !parents.contains_key(id) {
                violations.push(Violation::UnknownUser {
                    user_id: id.clone(),
                });
            }
        }
    }

    for member in &members {
        if cyclic.contains(&member.user_id) {
            continue;
        }
        let Some(expected) = chain_from_parents(&parents, &member.user_id) else {
            continue;
        };
        let actual = by_user
            .get(member.user_id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        check_user(&member.user_id, &expected, actual, &mut violations);
    }

    violations.dedup();
    Ok(VerifyReport {
        members: members.len(),
        rows: rows.len(),
        last_rebuild_at_us,
        violations,
    })
}

fn check_user(
    user_id: &str,
    expected: &[String],
    actual: &[&ClosureRow],
    violations: &mut Vec<Violation>,
) {
    let by_level: HashMap<u8, &ClosureRow> = actual.iter().map(|r| (r.level, *r)).collect();

    for (root, level) in expected.iter().zip(1_u8..) {
        match by_level.get(&level) {
            None => violations.push(Violation::MissingRow {
                user_id: user_id.to_string(),
                level,
                expected_root: root.clone(),
            }),
            Some(row) if &row.root_user_id != root => violations.push(Violation::WrongRoot {
                user_id: user_id.to_string(),
                level,
                expected_root: root.clone(),
                actual_root: row.root_user_id.clone(),
            }),
            Some(_) => {}
        }
    }

    for row in actual {
        if usize::from(row.level) > expected.len() {
            violations.push(Violation::ExtraRow {
                user_id: user_id.to_string(),
                level: row.level,
                root: row.root_user_id.clone(),
            });
        }
        if Some(&row.parent_user_id) != expected.first() {
            violations.push(Violation::ParentMismatch {
                user_id: user_id.to_string(),
                level: row.level,
                expected_parent: expected.first().cloned(),
                actual_parent: row.parent_user_id.clone(),
            });
        }
    }
}

/// Members whose upline never reaches a root, sorted.
pub(crate) fn find_cyclic(parents: &HashMap<String, Option<String>>) -> Vec<String> {
    let mut acyclic: HashSet<&str> = HashSet::new();
    let mut cyclic: HashSet<&str> = HashSet::new();

    let mut ids: Vec<&str> = parents.keys().map(String::as_str).collect();
    ids.sort_unstable();

    for start in ids {
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        let mut current = Some(start);
        let looped = loop {
            let Some(id) = current else { break false };
            if acyclic.contains(id) {
                break false;
            }
            if cyclic.contains(id) || !on_path.insert(id) {
                break true;
            }
            path.push(id);
            current = parents.get(id).and_then(Option::as_deref);
        };
        let bucket = if looped { &mut cyclic } else { &mut acyclic };
        bucket.extend(path);
    }

    let mut out: Vec<String> = cyclic.into_iter().map(str::to_string).collect();
    out.sort();
    out
}
