//! Read-side projection of a referral tree.
//!
//! Folds the flat closure rows under one root into a nested [`TreeNode`]
//! graph. Rows arrive ordered by level, so every row's parent is already
//! placed when the row is read; aggregates are filled in afterwards in a
//! single reverse pass.

#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::db::store::{self, MAX_CLOSURE_LEVEL};
use crate::error::HierarchyError;

/// One user in a projected tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub user_id: String,
    /// Distance from the projection root; the root itself is level 0.
    pub level: u8,
    pub parent_user_id: Option<String>,
    /// Percentage stored on the row linking this node to the root. `None`
    /// for the root.
    pub commission_percent: Option<f64>,
    pub is_active: bool,
    /// Users directly under this node, whether or not they were loaded.
    pub direct_referrals: usize,
    /// Nodes below this one within the loaded projection.
    pub total_descendants: usize,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Depth-first search for `user_id` within this subtree.
    pub fn find(&self, user_id: &str) -> Option<&Self> {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.user_id == user_id {
                return Some(node);
            }
            stack.extend(node.children.iter());
        }
        None
    }
}

/// Summary of a projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeMetadata {
    /// Nodes in the projection, root included.
    pub total_nodes: usize,
    /// Deepest level reached.
    pub max_depth: u8,
    /// Depth actually queried after clamping to the materialized limit.
    pub requested_depth: u8,
    /// `false` when some node on the deepest queried level still has
    /// referrals that were not loaded.
    pub is_complete: bool,
    /// Rows dropped because their parent was not in the projection.
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeStructure {
    pub root: TreeNode,
    pub metadata: TreeMetadata,
}

/// Build the nested tree under `root_user_id`, down to `max_level` levels
/// (default and upper bound: the materialized depth of 3).
///
/// # Errors
///
/// Returns [`HierarchyError::NotFound`] if the root is not registered, or
/// [`HierarchyError::Db`] for database failures.
pub fn get_tree_structure(
    conn: &Connection,
    root_user_id: &str,
    max_level: Option<u8>,
) -> Result<TreeStructure, HierarchyError> {
    let root_member = store::get_member(conn, root_user_id)?
        .ok_or_else(|| HierarchyError::NotFound(root_user_id.to_string()))?;
    let depth = max_level.unwrap_or(MAX_CLOSURE_LEVEL).min(MAX_CLOSURE_LEVEL);

    let rows = if depth == 0 {
        Vec::new()
    } else {
        store::get_descendant_rows(conn, root_user_id, Some(depth))?
    };

    let mut nodes = vec![TreeNode {
        user_id: root_member.user_id.clone(),
        level: 0,
        parent_user_id: root_member.parent_user_id,
        commission_percent: None,
        is_active: true,
        direct_referrals: 0,
        total_descendants: 0,
        children: Vec::new(),
    }];
    let mut parents: Vec<usize> = vec![0];
    let mut index: HashMap<String, usize> = HashMap::from([(root_member.user_id, 0)]);
    let mut skipped_rows = 0;

    for row in rows {
        let placed = index
            .get(&row.parent_user_id)
            .copied()
            .filter(|&p| nodes[p].level + 1 == row.level);
        let Some(parent) = placed else {
            warn!(
                root = root_user_id,
                user = %row.referred_user_id,
                parent = %row.parent_user_id,
                level = row.level,
                "closure row has no placed parent; skipping"
            );
            skipped_rows += 1;
            continue;
        };
        index.insert(row.referred_user_id.clone(), nodes.len());
        parents.push(parent);
        nodes.push(TreeNode {
            user_id: row.referred_user_id,
            level: row.level,
            parent_user_id: Some(row.parent_user_id),
            commission_percent: Some(row.commission_percent),
            is_active: row.is_active,
            direct_referrals: 0,
            total_descendants: 0,
            children: Vec::new(),
        });
    }

    let ids: Vec<String> = nodes.iter().map(|n| n.user_id.clone()).collect();
    let counts = store::count_direct_referrals(conn, &ids)?;
    for node in &mut nodes {
        node.direct_referrals = counts.get(&node.user_id).copied().unwrap_or(0);
    }

    let max_depth = nodes.iter().map(|n| n.level).max().unwrap_or(0);
    let is_complete = !nodes
        .iter()
        .any(|n| n.level == depth && n.direct_referrals > 0);
    let total_nodes = nodes.len();

    let root = assemble(nodes, &parents);
    Ok(TreeStructure {
        root,
        metadata: TreeMetadata {
            total_nodes,
            max_depth,
            requested_depth: depth,
            is_complete,
            skipped_rows,
        },
    })
}

/// Nest `nodes` under their parents, bottom-up, filling `total_descendants`.
///
/// `parents[i] < i` for every `i > 0`, and `nodes[0]` is the root.
fn assemble(nodes: Vec<TreeNode>, parents: &[usize]) -> TreeNode {
    let mut totals = vec![0_usize; nodes.len()];
    let mut slots: Vec<Option<TreeNode>> = nodes.into_iter().map(Some).collect();

    for i in (1..slots.len()).rev() {
        let Some(mut node) = slots[i].take() else {
            continue;
        };
        node.total_descendants = totals[i];
        node.children.reverse();
        let parent = parents[i];
        totals[parent] += 1 + totals[i];
        if let Some(parent_node) = slots[parent].as_mut() {
            parent_node.children.push(node);
        }
    }

    let mut root = slots
        .first_mut()
        .and_then(Option::take)
        .unwrap_or_else(|| TreeNode {
            user_id: String::new(),
            level: 0,
            parent_user_id: None,
            commission_percent: None,
            is_active: true,
            direct_referrals: 0,
            total_descendants: 0,
            children: Vec::new(),
        });
    root.total_descendants = totals.first().copied().unwrap_or(0);
    root.children.reverse();
    root
}
