//! Hierarchy mutation engine for referral uplines.
//!
//! Every user has at most one upline. The engine keeps two structures in
//! step:
//!
//! - the `referral_members` adjacency list, authoritative for traversal and
//!   cycle checks at any depth
//! - the `referral_closure` index, materializing the three nearest ancestors
//!   of every placed user
//!
//! # Mutations
//!
//! `assign_orphan_user`, `add_referral`, `move_downline`,
//! `auto_promote_downlines` and `detach_user` all reduce to one primitive,
//! [`reparent_subtree`]: repoint one adjacency edge, walk the subtree below
//! it breadth-first, recompute each node's three-level chain, and replace
//! the rows of every node whose chain changed. Each mutation runs inside a
//! single [`WriteScope`], so a reader never sees a subtree half moved and any
//! failure leaves the store as it was.
//!
//! Reads run inside a [`ReadScope`], so the several queries behind one
//! answer all see the same committed state.
//!
//! # Cycle prevention
//!
//! [`ReferralEngine::is_descendant`] answers from the closure rows when the
//! ancestor sits within three levels and falls back to walking the adjacency
//! list when the candidate's materialized chain is full, so the guard never
//! depends on the materialization limit.

#![allow(
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

use anyhow::{Context as AnyhowContext, anyhow};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::config::CommissionConfig;
use crate::db::scope::{ReadScope, WriteScope};
use crate::db::store::{self, ClosureRow, MAX_CLOSURE_LEVEL, MemberRecord};
use crate::error::HierarchyError;
use crate::graph::tree::{self, TreeStructure};
use crate::graph::verify::find_cyclic;

const MAX_CHAIN: usize = MAX_CLOSURE_LEVEL as usize;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Outcome of rewriting one subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteSummary {
    /// Nodes in the moved subtree, including its top.
    pub subtree_size: usize,
    /// Nodes whose closure rows were replaced.
    pub rewritten: usize,
}

impl RewriteSummary {
    fn absorb(&mut self, other: &Self) {
        self.subtree_size += other.subtree_size;
        self.rewritten += other.rewritten;
    }
}

/// Outcome of [`ReferralEngine::auto_promote_downlines`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionSummary {
    pub deleted_user_id: String,
    /// Upline the former direct referrals now sit under; `None` when the
    /// deleted user was a root.
    pub new_parent_id: Option<String>,
    /// Former direct referrals, sorted.
    pub promoted: Vec<String>,
    pub rewrite: RewriteSummary,
}

/// A direct referral of some user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownlineNode {
    pub user_id: String,
    pub commission_percent: f64,
    pub is_active: bool,
    /// When the user first registered; unaffected by later moves.
    pub joined_at_us: i64,
    /// Number of users directly under this one.
    pub direct_referrals: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Entry point for hierarchy reads and mutations on one connection.
pub struct ReferralEngine<'conn> {
    conn: &'conn Connection,
    commission: CommissionConfig,
    actor: Option<String>,
}

impl<'conn> ReferralEngine<'conn> {
    /// Engine with the default commission schedule and no audit actor.
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            commission: CommissionConfig::default(),
            actor: None,
        }
    }

    /// Use `commission` for the percentages stamped onto new rows.
    #[must_use]
    pub fn with_commission(mut self, commission: CommissionConfig) -> Self {
        self.commission = commission;
        self
    }

    /// Record `actor` in the audit columns of rows this engine writes.
    #[must_use]
    pub fn acting_as(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    // -- reads --------------------------------------------------------------

    /// Whether `candidate_id` sits anywhere below `ancestor_id`.
    ///
    /// Always `false` for `ancestor_id == candidate_id`.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::Db`] for database failures.
    pub fn is_descendant(
        &self,
        ancestor_id: &str,
        candidate_id: &str,
    ) -> Result<bool, HierarchyError> {
        self.in_read(|conn| is_descendant(conn, ancestor_id, candidate_id))
    }

    /// Whether `referred_user_id` may be placed directly under
    /// `root_user_id`.
    ///
    /// `false` if the referred user already has an upline, if both ids are
    /// the same, or if `root_user_id` is inside the referred user's downline.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::Db`] for database failures.
    pub fn can_add_referral(
        &self,
        root_user_id: &str,
        referred_user_id: &str,
    ) -> Result<bool, HierarchyError> {
        if root_user_id == referred_user_id {
            return Ok(false);
        }
        self.in_read(|conn| {
            if current_upline(conn, referred_user_id)?.is_some() {
                return Ok(false);
            }
            Ok(!is_descendant(conn, referred_user_id, root_user_id)?)
        })
    }

    /// Immediate upline of `user_id`, `None` for roots and orphans.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if the user is not registered.
    pub fn get_parent(&self, user_id: &str) -> Result<Option<String>, HierarchyError> {
        self.in_read(|conn| Ok(require_member(conn, user_id)?.parent_user_id))
    }

    /// Materialized ancestor rows of `user_id`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if the user is not registered.
    pub fn get_upline(&self, user_id: &str) -> Result<Vec<ClosureRow>, HierarchyError> {
        self.in_read(|conn| {
            require_member(conn, user_id)?;
            Ok(store::get_ancestor_rows(conn, user_id)?)
        })
    }

    /// Users directly under `user_id`, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if the user is not registered.
    pub fn get_direct_downlines(&self, user_id: &str) -> Result<Vec<DownlineNode>, HierarchyError> {
        self.in_read(|conn| {
            require_member(conn, user_id)?;
            let rows = store::get_by_parent(conn, user_id)?;
            let ids: Vec<String> = rows.iter().map(|r| r.referred_user_id.clone()).collect();
            let counts = store::count_direct_referrals(conn, &ids)?;

            rows.into_iter()
                .map(|row| -> Result<DownlineNode, HierarchyError> {
                    let joined_at_us = require_member(conn, &row.referred_user_id)?.joined_at_us;
                    Ok(DownlineNode {
                        direct_referrals: counts.get(&row.referred_user_id).copied().unwrap_or(0),
                        user_id: row.referred_user_id,
                        commission_percent: row.commission_percent,
                        is_active: row.is_active,
                        joined_at_us,
                    })
                })
                .collect()
        })
    }

    /// Nested projection of the tree under `root_user_id`.
    ///
    /// # Errors
    ///
    /// See [`tree::get_tree_structure`].
    pub fn get_tree_structure(
        &self,
        root_user_id: &str,
        max_level: Option<u8>,
    ) -> Result<TreeStructure, HierarchyError> {
        self.in_read(|conn| tree::get_tree_structure(conn, root_user_id, max_level))
    }

    // -- mutations ----------------------------------------------------------

    /// Register `user_id` as a parentless member. Returns `false` if it was
    /// already registered.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::InvalidUserId`] for a blank id, or
    /// [`HierarchyError::Db`] for database failures.
    pub fn register_user(&self, user_id: &str) -> Result<bool, HierarchyError> {
        validate_user_id(user_id)?;
        self.in_scope(|conn| Ok(store::insert_member(conn, user_id, None)?))
    }

    /// Place a newly referred user under its sponsor, registering it first
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if the sponsor is not registered,
    /// [`HierarchyError::Conflict`] if the referred user already has an
    /// upline, [`HierarchyError::CycleDetected`] for self-referrals or when
    /// the sponsor sits in the referred user's downline, or
    /// [`HierarchyError::InvalidUserId`] if the referred id is blank.
    pub fn add_referral(
        &self,
        root_user_id: &str,
        referred_user_id: &str,
    ) -> Result<RewriteSummary, HierarchyError> {
        validate_user_id(referred_user_id)?;
        let summary = self.in_scope(|conn| {
            require_member(conn, root_user_id)?;
            if store::insert_member(conn, referred_user_id, None)? {
                debug!(user = referred_user_id, "registered referred user");
            }
            self.attach_orphan(conn, referred_user_id, root_user_id)
        })?;
        info!(
            sponsor = root_user_id,
            user = referred_user_id,
            rewritten = summary.rewritten,
            "added referral"
        );
        Ok(summary)
    }

    /// Attach a parentless user (and any subtree it already carries) under
    /// `target_parent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if either user is not registered,
    /// [`HierarchyError::Conflict`] if the orphan already has an upline,
    /// [`HierarchyError::CycleDetected`] if the target is the orphan itself
    /// or sits in its downline.
    pub fn assign_orphan_user(
        &self,
        orphan_user_id: &str,
        target_parent_id: &str,
    ) -> Result<RewriteSummary, HierarchyError> {
        let summary =
            self.in_scope(|conn| self.attach_orphan(conn, orphan_user_id, target_parent_id))?;
        info!(
            user = orphan_user_id,
            new_parent = target_parent_id,
            subtree = summary.subtree_size,
            rewritten = summary.rewritten,
            "assigned orphan"
        );
        Ok(summary)
    }

    /// Move `user_id_to_move` and its entire downline under `new_parent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if either user is not registered,
    /// or [`HierarchyError::CycleDetected`] if the new parent is the user
    /// itself or one of its descendants.
    pub fn move_downline(
        &self,
        user_id_to_move: &str,
        new_parent_id: &str,
    ) -> Result<RewriteSummary, HierarchyError> {
        let summary = self.in_scope(|conn| {
            require_member(conn, user_id_to_move)?;
            require_member(conn, new_parent_id)?;
            if user_id_to_move == new_parent_id
                || is_descendant(conn, user_id_to_move, new_parent_id)?
            {
                return Err(HierarchyError::cycle(user_id_to_move, new_parent_id));
            }
            self.rewrite(conn, user_id_to_move, Some(new_parent_id), self.actor.as_deref())
        })?;
        info!(
            user = user_id_to_move,
            new_parent = new_parent_id,
            subtree = summary.subtree_size,
            rewritten = summary.rewritten,
            "moved downline"
        );
        Ok(summary)
    }

    /// Remove `deleted_user_id` from the tree, promoting each direct referral
    /// (with its downline) to the deleted user's own upline.
    ///
    /// Call this before deleting the user elsewhere; afterwards no closure
    /// row or membership record references it.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if the user is not registered.
    pub fn auto_promote_downlines(
        &self,
        deleted_user_id: &str,
        deleted_by: Option<&str>,
    ) -> Result<PromotionSummary, HierarchyError> {
        let actor = deleted_by.or(self.actor.as_deref());
        let summary = self.in_scope(|conn| {
            let member = require_member(conn, deleted_user_id)?;
            let grandparent = member.parent_user_id;
            if let Some(row) = store::get_ancestor_rows(conn, deleted_user_id)?.first() {
                if Some(&row.parent_user_id) != grandparent.as_ref() {
                    warn!(
                        user = deleted_user_id,
                        closure_parent = %row.parent_user_id,
                        "closure parent disagrees with adjacency; using adjacency"
                    );
                }
            }

            let children = store::get_children(conn, deleted_user_id)?;
            let mut rewrite = RewriteSummary::default();
            for child in &children {
                let moved = self.rewrite(conn, child, grandparent.as_deref(), actor)?;
                rewrite.absorb(&moved);
            }

            store::delete_rows_for_user(conn, deleted_user_id)?;
            store::delete_member(conn, deleted_user_id)?;

            Ok(PromotionSummary {
                deleted_user_id: deleted_user_id.to_string(),
                new_parent_id: grandparent,
                promoted: children,
                rewrite,
            })
        })?;
        info!(
            user = deleted_user_id,
            new_parent = summary.new_parent_id.as_deref().unwrap_or("<root>"),
            promoted = summary.promoted.len(),
            rewritten = summary.rewrite.rewritten,
            "promoted downlines"
        );
        Ok(summary)
    }

    /// Cut `user_id` loose from its upline, keeping its downline attached to
    /// it. A user that is already a root is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::NotFound`] if the user is not registered.
    pub fn detach_user(&self, user_id: &str) -> Result<RewriteSummary, HierarchyError> {
        let summary = self.in_scope(|conn| {
            let member = require_member(conn, user_id)?;
            if member.parent_user_id.is_none() {
                return Ok(RewriteSummary::default());
            }
            self.rewrite(conn, user_id, None, self.actor.as_deref())
        })?;
        info!(user = user_id, rewritten = summary.rewritten, "detached user");
        Ok(summary)
    }

    /// Recompute the whole closure index from the adjacency list. Returns the
    /// number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`HierarchyError::Db`] if the adjacency list contains a cycle
    /// or the store fails.
    pub fn rebuild_closure(&self) -> Result<usize, HierarchyError> {
        let written = self.in_scope(|conn| {
            let members = store::list_members(conn)?;
            let parents: HashMap<String, Option<String>> = members
                .iter()
                .map(|m| (m.user_id.clone(), m.parent_user_id.clone()))
                .collect();

            if let Some(user_id) = find_cyclic(&parents).first() {
                return Err(anyhow!("upline of '{user_id}' loops back on itself").into());
            }

            store::delete_all_rows(conn)?;
            let now = store::now_us();
            let mut written = 0;
            for member in &members {
                let chain = chain_from_parents(&parents, &member.user_id).with_context(|| {
                    format!("upline of '{}' loops back on itself", member.user_id)
                })?;
                let rows =
                    self.build_rows(&member.user_id, &chain, &[], self.actor.as_deref(), now);
                store::replace_rows_for_user(conn, &member.user_id, &rows)?;
                written += rows.len();
            }
            store::mark_rebuilt(conn)?;
            Ok(written)
        })?;
        info!(rows = written, "rebuilt closure index");
        Ok(written)
    }

    // -- internals ----------------------------------------------------------

    fn in_scope<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, HierarchyError>,
    ) -> Result<T, HierarchyError> {
        let scope = WriteScope::begin(self.conn).context("begin referral mutation")?;
        let value = op(scope.conn())?;
        scope.commit().context("commit referral mutation")?;
        Ok(value)
    }

    fn in_read<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, HierarchyError>,
    ) -> Result<T, HierarchyError> {
        let scope = ReadScope::begin(self.conn).context("begin referral read")?;
        let value = op(scope.conn())?;
        scope.finish().context("end referral read")?;
        Ok(value)
    }

    fn attach_orphan(
        &self,
        conn: &Connection,
        orphan_user_id: &str,
        target_parent_id: &str,
    ) -> Result<RewriteSummary, HierarchyError> {
        require_member(conn, orphan_user_id)?;
        require_member(conn, target_parent_id)?;
        if orphan_user_id == target_parent_id {
            return Err(HierarchyError::cycle(orphan_user_id, target_parent_id));
        }
        if let Some(existing_parent) = current_upline(conn, orphan_user_id)? {
            return Err(HierarchyError::Conflict {
                user_id: orphan_user_id.to_string(),
                existing_parent,
            });
        }
        if is_descendant(conn, orphan_user_id, target_parent_id)? {
            return Err(HierarchyError::cycle(orphan_user_id, target_parent_id));
        }
        self.rewrite(conn, orphan_user_id, Some(target_parent_id), self.actor.as_deref())
    }

    fn rewrite(
        &self,
        conn: &Connection,
        top: &str,
        new_parent: Option<&str>,
        actor: Option<&str>,
    ) -> Result<RewriteSummary, HierarchyError> {
        reparent_subtree(conn, top, new_parent, |user, chain, existing, now| {
            self.build_rows(user, chain, existing, actor, now)
        })
    }

    /// Closure rows for `user_id` given its ancestor `chain` (nearest first).
    ///
    /// A row whose `(level, root)` pair survives from `existing` keeps its
    /// commission, activity flag and creation stamp.
    fn build_rows(
        &self,
        user_id: &str,
        chain: &[String],
        existing: &[ClosureRow],
        actor: Option<&str>,
        now: i64,
    ) -> Vec<ClosureRow> {
        let Some(parent) = chain.first() else {
            return Vec::new();
        };
        chain
            .iter()
            .zip(1..=MAX_CLOSURE_LEVEL)
            .map(|(root, level)| {
                let kept = existing
                    .iter()
                    .find(|r| r.level == level && &r.root_user_id == root);
                ClosureRow {
                    root_user_id: root.clone(),
                    referred_user_id: user_id.to_string(),
                    level,
                    parent_user_id: parent.clone(),
                    commission_percent: kept.map_or_else(
                        || self.commission.percent_for_level(level),
                        |r| r.commission_percent,
                    ),
                    is_active: kept.is_none_or(|r| r.is_active),
                    created_at_us: kept.map_or(now, |r| r.created_at_us),
                    created_by: kept.map_or_else(
                        || actor.map(str::to_string),
                        |r| r.created_by.clone(),
                    ),
                    updated_at_us: now,
                    updated_by: actor.map(str::to_string),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Traversal primitives
// ---------------------------------------------------------------------------

/// Whether `candidate_id` sits anywhere below `ancestor_id`.
///
/// # Errors
///
/// Returns [`HierarchyError::Db`] for database failures.
pub fn is_descendant(
    conn: &Connection,
    ancestor_id: &str,
    candidate_id: &str,
) -> Result<bool, HierarchyError> {
    if ancestor_id == candidate_id {
        return Ok(false);
    }

    let rows = store::get_ancestor_rows(conn, candidate_id)?;
    if rows.iter().any(|r| r.root_user_id == ancestor_id) {
        return Ok(true);
    }
    let Some(deepest) = rows.last().filter(|_| rows.len() >= MAX_CHAIN) else {
        // Chain ends inside the materialized window.
        return Ok(false);
    };

    let mut visited: HashSet<String> = rows.iter().map(|r| r.root_user_id.clone()).collect();
    visited.insert(candidate_id.to_string());
    let mut current = store::get_member(conn, &deepest.root_user_id)?
        .and_then(|m| m.parent_user_id);

    while let Some(id) = current {
        if id == ancestor_id {
            return Ok(true);
        }
        if !visited.insert(id.clone()) {
            warn!(user = candidate_id, at = %id, "upline walk revisited a user");
            return Ok(false);
        }
        current = store::get_member(conn, &id)?.and_then(|m| m.parent_user_id);
    }
    Ok(false)
}

/// Repoint `top` at `new_parent` and re-derive the closure rows of `top` and
/// every descendant.
///
/// The subtree is collected breadth-first with an explicit queue, with no
/// depth limit. Chains are computed in memory from the new attachment point;
/// rows are then replaced in ascending user-id order, skipping nodes whose
/// chain did not change. `make_rows` turns `(user, chain, existing rows,
/// timestamp)` into the replacement rows.
///
/// Callers must hold a [`WriteScope`] and must have ruled out cycles.
///
/// # Errors
///
/// Returns [`HierarchyError::NotFound`] if `top` is not registered,
/// [`HierarchyError::StorageConflict`] on a uniqueness violation, or
/// [`HierarchyError::Db`].
pub fn reparent_subtree(
    conn: &Connection,
    top: &str,
    new_parent: Option<&str>,
    make_rows: impl Fn(&str, &[String], &[ClosureRow], i64) -> Vec<ClosureRow>,
) -> Result<RewriteSummary, HierarchyError> {
    if !store::set_parent(conn, top, new_parent)? {
        return Err(HierarchyError::NotFound(top.to_string()));
    }

    let top_chain = match new_parent {
        Some(parent) => {
            let mut chain = vec![parent.to_string()];
            chain.extend(upline_ids(conn, parent, MAX_CHAIN - 1)?);
            chain
        }
        None => Vec::new(),
    };

    let mut chains: HashMap<String, Vec<String>> = HashMap::new();
    chains.insert(top.to_string(), top_chain);
    let mut queue: VecDeque<String> = VecDeque::from([top.to_string()]);
    let mut subtree: Vec<String> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        let child_chain: Vec<String> = std::iter::once(current.clone())
            .chain(chains[&current].iter().take(MAX_CHAIN - 1).cloned())
            .collect();
        for child in store::get_children(conn, &current)? {
            if visited.contains(&child) {
                continue;
            }
            chains.insert(child.clone(), child_chain.clone());
            queue.push_back(child);
        }
        subtree.push(current);
    }

    subtree.sort();
    let now = store::now_us();
    let mut rewritten = 0;
    for user in &subtree {
        let chain = &chains[user];
        let existing = store::get_ancestor_rows(conn, user)?;
        if chain_matches(&existing, chain) {
            continue;
        }
        let rows = make_rows(user, chain, &existing, now);
        store::replace_rows_for_user(conn, user, &rows)?;
        debug!(user = %user, levels = rows.len(), "replaced closure rows");
        rewritten += 1;
    }

    Ok(RewriteSummary {
        subtree_size: subtree.len(),
        rewritten,
    })
}

/// Nearest-first ancestor chain of `user_id` from an in-memory parent map,
/// truncated to the materialized depth. `None` if the upline loops back
/// within that window; longer loops need [`find_cyclic`].
pub(crate) fn chain_from_parents(
    parents: &HashMap<String, Option<String>>,
    user_id: &str,
) -> Option<Vec<String>> {
    let mut chain = Vec::with_capacity(MAX_CHAIN);
    let mut seen: HashSet<&str> = HashSet::from([user_id]);
    let mut current = parents.get(user_id).and_then(Option::as_deref);
    while let Some(id) = current {
        if chain.len() == MAX_CHAIN {
            break;
        }
        if !seen.insert(id) {
            return None;
        }
        chain.push(id.to_string());
        current = parents.get(id).and_then(Option::as_deref);
    }
    Some(chain)
}

fn chain_matches(existing: &[ClosureRow], chain: &[String]) -> bool {
    existing.len() == chain.len()
        && existing
            .iter()
            .zip(chain)
            .zip(1..=MAX_CLOSURE_LEVEL)
            .all(|((row, root), level)| {
                row.level == level
                    && &row.root_user_id == root
                    && Some(&row.parent_user_id) == chain.first()
            })
}

/// Up to `limit` ancestors above `user_id`, nearest first, from adjacency.
fn upline_ids(
    conn: &Connection,
    user_id: &str,
    limit: usize,
) -> Result<Vec<String>, HierarchyError> {
    let mut ids = Vec::with_capacity(limit);
    let mut current = require_member(conn, user_id)?.parent_user_id;
    while let Some(id) = current {
        if ids.len() == limit {
            break;
        }
        current = store::get_member(conn, &id)?.and_then(|m| m.parent_user_id);
        ids.push(id);
    }
    Ok(ids)
}

/// Current upline from adjacency, falling back to a stray level-1 row.
fn current_upline(conn: &Connection, user_id: &str) -> Result<Option<String>, HierarchyError> {
    if let Some(parent) = store::get_member(conn, user_id)?.and_then(|m| m.parent_user_id) {
        return Ok(Some(parent));
    }
    Ok(store::get_ancestor_rows(conn, user_id)?
        .into_iter()
        .next()
        .map(|row| row.parent_user_id))
}

fn validate_user_id(user_id: &str) -> Result<(), HierarchyError> {
    if user_id.trim().is_empty() {
        return Err(HierarchyError::InvalidUserId(user_id.to_string()));
    }
    Ok(())
}

fn require_member(conn: &Connection, user_id: &str) -> Result<MemberRecord, HierarchyError> {
    store::get_member(conn, user_id)?.ok_or_else(|| HierarchyError::NotFound(user_id.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn chain_of(conn: &Connection, user: &str) -> Vec<(String, u8)> {
        store::get_ancestor_rows(conn, user)
            .expect("ancestor rows")
            .into_iter()
            .map(|r| (r.root_user_id, r.level))
            .collect()
    }

    fn pairs(expected: &[(&str, u8)]) -> Vec<(String, u8)> {
        expected.iter().map(|(id, l)| ((*id).to_string(), *l)).collect()
    }

    /// a -> b -> c -> d -> e
    fn line(conn: &Connection) {
        let engine = ReferralEngine::new(conn);
        engine.register_user("a").expect("register a");
        engine.add_referral("a", "b").expect("b");
        engine.add_referral("b", "c").expect("c");
        engine.add_referral("c", "d").expect("d");
        engine.add_referral("d", "e").expect("e");
    }

    #[test]
    fn register_is_idempotent() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        assert!(engine.register_user("a").expect("first"));
        assert!(!engine.register_user("a").expect("second"));
        assert_eq!(engine.get_parent("a").expect("parent"), None);
    }

    #[test]
    fn add_referral_materializes_three_levels() {
        let conn = open_in_memory().expect("open store");
        line(&conn);

        assert_eq!(chain_of(&conn, "b"), pairs(&[("a", 1)]));
        assert_eq!(chain_of(&conn, "d"), pairs(&[("c", 1), ("b", 2), ("a", 3)]));
        assert_eq!(chain_of(&conn, "e"), pairs(&[("d", 1), ("c", 2), ("b", 3)]));
        assert!(chain_of(&conn, "a").is_empty());
    }

    #[test]
    fn add_referral_requires_registered_sponsor() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        let err = engine.add_referral("ghost", "b").unwrap_err();
        assert!(matches!(err, HierarchyError::NotFound(ref id) if id == "ghost"));
        assert!(store::get_member(&conn, "b").expect("get").is_none());
    }

    #[test]
    fn add_referral_twice_conflicts_and_keeps_first_upline() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);

        let err = engine.add_referral("a", "c").unwrap_err();
        assert!(
            matches!(err, HierarchyError::Conflict { ref existing_parent, .. } if existing_parent == "b")
        );
        assert_eq!(engine.get_parent("c").expect("parent").as_deref(), Some("b"));
    }

    #[test]
    fn is_descendant_within_window() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);

        assert!(engine.is_descendant("a", "b").expect("a>b"));
        assert!(engine.is_descendant("a", "d").expect("a>d"));
        assert!(!engine.is_descendant("d", "a").expect("d>a"));
        assert!(!engine.is_descendant("c", "c").expect("self"));
    }

    #[test]
    fn is_descendant_beyond_window_walks_adjacency() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);

        // e's closure rows stop at b; a is four levels up.
        assert!(!chain_of(&conn, "e").iter().any(|(root, _)| root == "a"));
        assert!(engine.is_descendant("a", "e").expect("a>e"));
        assert!(!engine.is_descendant("e", "a").expect("e>a"));
    }

    #[test]
    fn can_add_referral_rules() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);
        engine.register_user("x").expect("x");

        assert!(engine.can_add_referral("b", "x").expect("fresh orphan"));
        assert!(engine.can_add_referral("e", "x").expect("deep sponsor"));
        assert!(!engine.can_add_referral("x", "x").expect("self"));
        assert!(!engine.can_add_referral("x", "c").expect("already placed"));
        assert!(!engine.can_add_referral("e", "a").expect("would loop"));
        assert!(engine.can_add_referral("a", "never-seen").expect("unknown user"));
    }

    #[test]
    fn assign_orphan_self_is_cycle() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        engine.register_user("x").expect("x");
        let err = engine.assign_orphan_user("x", "x").unwrap_err();
        assert!(matches!(err, HierarchyError::CycleDetected { .. }));
    }

    #[test]
    fn assign_orphan_with_subtree_extends_descendant_chains() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);
        // detached tree x -> y -> z
        engine.register_user("x").expect("x");
        engine.add_referral("x", "y").expect("y");
        engine.add_referral("y", "z").expect("z");

        let summary = engine.assign_orphan_user("x", "b").expect("assign");
        assert_eq!(summary.subtree_size, 3);
        assert_eq!(summary.rewritten, 3);

        assert_eq!(chain_of(&conn, "x"), pairs(&[("b", 1), ("a", 2)]));
        assert_eq!(chain_of(&conn, "y"), pairs(&[("x", 1), ("b", 2), ("a", 3)]));
        assert_eq!(chain_of(&conn, "z"), pairs(&[("y", 1), ("x", 2), ("b", 3)]));
    }

    #[test]
    fn assign_orphan_into_own_downline_is_cycle() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        engine.register_user("x").expect("x");
        engine.add_referral("x", "y").expect("y");

        let err = engine.assign_orphan_user("x", "y").unwrap_err();
        assert!(matches!(err, HierarchyError::CycleDetected { .. }));
    }

    #[test]
    fn assign_orphan_unknown_target_not_found() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        engine.register_user("x").expect("x");
        let err = engine.assign_orphan_user("x", "ghost").unwrap_err();
        assert!(matches!(err, HierarchyError::NotFound(ref id) if id == "ghost"));
    }

    #[test]
    fn move_skips_nodes_whose_chain_is_unchanged() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        // a -> b -> c -> d -> e -> f, plus a -> q
        engine.register_user("a").expect("a");
        for (parent, child) in [("a", "b"), ("b", "c"), ("c", "d"), ("d", "e"), ("e", "f")] {
            engine.add_referral(parent, child).expect("chain");
        }
        engine.add_referral("a", "q").expect("q");

        let summary = engine.move_downline("b", "q").expect("move");
        assert_eq!(summary.subtree_size, 5);
        // b, c, d see q within three levels; e's chain is d, c, b either way.
        assert_eq!(summary.rewritten, 3);
        assert_eq!(chain_of(&conn, "e"), pairs(&[("d", 1), ("c", 2), ("b", 3)]));
        assert_eq!(chain_of(&conn, "d"), pairs(&[("c", 1), ("b", 2), ("q", 3)]));
    }

    #[test]
    fn move_to_unknown_parent_not_found() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);
        let err = engine.move_downline("c", "ghost").unwrap_err();
        assert!(matches!(err, HierarchyError::NotFound(_)));
        assert_eq!(engine.get_parent("c").expect("parent").as_deref(), Some("b"));
    }

    #[test]
    fn move_onto_self_is_cycle() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);
        let err = engine.move_downline("c", "c").unwrap_err();
        assert!(matches!(err, HierarchyError::CycleDetected { .. }));
    }

    #[test]
    fn promote_middle_node_reparents_children_to_grandparent() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);

        let summary = engine
            .auto_promote_downlines("c", Some("admin"))
            .expect("promote");
        assert_eq!(summary.new_parent_id.as_deref(), Some("b"));
        assert_eq!(summary.promoted, vec!["d"]);

        assert_eq!(engine.get_parent("d").expect("d").as_deref(), Some("b"));
        assert_eq!(chain_of(&conn, "d"), pairs(&[("b", 1), ("a", 2)]));
        assert_eq!(chain_of(&conn, "e"), pairs(&[("d", 1), ("b", 2), ("a", 3)]));
        assert!(store::get_member(&conn, "c").expect("get").is_none());
        assert!(chain_of(&conn, "c").is_empty());

        let d_rows = store::get_ancestor_rows(&conn, "d").expect("rows");
        assert!(d_rows.iter().all(|r| r.updated_by.as_deref() == Some("admin")));
    }

    #[test]
    fn promote_root_makes_children_roots() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        engine.register_user("r").expect("r");
        engine.add_referral("r", "k1").expect("k1");
        engine.add_referral("r", "k2").expect("k2");
        engine.add_referral("k1", "g").expect("g");

        let summary = engine.auto_promote_downlines("r", None).expect("promote");
        assert_eq!(summary.new_parent_id, None);
        assert_eq!(summary.promoted, vec!["k1", "k2"]);

        assert_eq!(engine.get_parent("k1").expect("k1"), None);
        assert!(chain_of(&conn, "k1").is_empty());
        assert!(chain_of(&conn, "k2").is_empty());
        assert_eq!(chain_of(&conn, "g"), pairs(&[("k1", 1)]));
    }

    #[test]
    fn promote_unknown_user_not_found() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        let err = engine.auto_promote_downlines("ghost", None).unwrap_err();
        assert!(matches!(err, HierarchyError::NotFound(_)));
    }

    #[test]
    fn detach_keeps_downline_attached() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);

        engine.detach_user("c").expect("detach");
        assert_eq!(engine.get_parent("c").expect("c"), None);
        assert!(chain_of(&conn, "c").is_empty());
        assert_eq!(chain_of(&conn, "d"), pairs(&[("c", 1)]));
        assert_eq!(chain_of(&conn, "e"), pairs(&[("d", 1), ("c", 2)]));

        let again = engine.detach_user("c").expect("detach root");
        assert_eq!(again, RewriteSummary::default());
    }

    #[test]
    fn rebuild_reproduces_incremental_rows() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);
        engine.add_referral("b", "b2").expect("b2");

        let before: Vec<_> = store::list_all_rows(&conn)
            .expect("rows")
            .into_iter()
            .map(|r| (r.referred_user_id, r.level, r.root_user_id, r.parent_user_id))
            .collect();
        conn.execute("DELETE FROM referral_closure WHERE referred_user_id = 'e'", [])
            .expect("corrupt");

        let written = engine.rebuild_closure().expect("rebuild");
        let after: Vec<_> = store::list_all_rows(&conn)
            .expect("rows")
            .into_iter()
            .map(|r| (r.referred_user_id, r.level, r.root_user_id, r.parent_user_id))
            .collect();
        assert_eq!(written, before.len());
        assert_eq!(before, after);
    }

    #[test]
    fn rebuild_refuses_looping_adjacency() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        conn.execute("UPDATE referral_members SET parent_user_id = 'e' WHERE user_id = 'a'", [])
            .expect("close loop");
        let rows_before = store::list_all_rows(&conn).expect("rows").len();

        let err = ReferralEngine::new(&conn).rebuild_closure().unwrap_err();
        assert!(matches!(err, HierarchyError::Db(_)));
        assert!(err.to_string().contains("loops"), "{err}");
        assert_eq!(store::list_all_rows(&conn).expect("rows").len(), rows_before);
    }

    #[test]
    fn commission_schedule_stamped_by_level() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn).with_commission(CommissionConfig {
            levels: vec![20.0, 10.0],
        });
        engine.register_user("a").expect("a");
        engine.add_referral("a", "b").expect("b");
        engine.add_referral("b", "c").expect("c");
        engine.add_referral("c", "d").expect("d");

        let rows = store::get_ancestor_rows(&conn, "d").expect("rows");
        let percents: Vec<f64> = rows.iter().map(|r| r.commission_percent).collect();
        assert_eq!(percents, vec![20.0, 10.0, 0.0]);
    }

    #[test]
    fn direct_downlines_carry_child_counts() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);
        engine.add_referral("a", "b2").expect("b2");

        let downlines = engine.get_direct_downlines("a").expect("downlines");
        let summary: Vec<_> = downlines
            .iter()
            .map(|n| (n.user_id.as_str(), n.direct_referrals))
            .collect();
        assert_eq!(summary, vec![("b", 1), ("b2", 0)]);

        let err = engine.get_direct_downlines("ghost").unwrap_err();
        assert!(matches!(err, HierarchyError::NotFound(_)));
    }

    #[test]
    fn chain_from_parents_truncates_and_detects_loops() {
        let parents: HashMap<String, Option<String>> = [
            ("e", Some("d")),
            ("d", Some("c")),
            ("c", Some("b")),
            ("b", Some("a")),
            ("a", None),
            ("x", Some("y")),
            ("y", Some("x")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect();

        assert_eq!(
            chain_from_parents(&parents, "e"),
            Some(vec!["d".to_string(), "c".to_string(), "b".to_string()])
        );
        assert_eq!(chain_from_parents(&parents, "a"), Some(Vec::new()));
        assert_eq!(chain_from_parents(&parents, "x"), None);
    }

    #[test]
    fn blank_ids_are_rejected() {
        let conn = open_in_memory().expect("open store");
        let engine = ReferralEngine::new(&conn);
        engine.register_user("a").expect("a");

        let err = engine.register_user("  ").unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidUserId(ref id) if id == "  "));
        assert!(err.is_recoverable());

        let err = engine.add_referral("a", "").unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidUserId(_)));
        assert_eq!(store::list_members(&conn).expect("list").len(), 1);
    }

    #[test]
    fn downline_join_time_survives_moves() {
        let conn = open_in_memory().expect("open store");
        line(&conn);
        let engine = ReferralEngine::new(&conn);
        engine.register_user("q").expect("q");
        let joined = store::get_member(&conn, "c")
            .expect("get")
            .expect("present")
            .joined_at_us;

        engine.move_downline("c", "q").expect("move");

        let downlines = engine.get_direct_downlines("q").expect("downlines");
        assert_eq!(downlines.len(), 1);
        assert_eq!(downlines[0].user_id, "c");
        assert_eq!(downlines[0].joined_at_us, joined);
    }
}
