//! `refer can-add|is-descendant|downlines|upline|tree`: read-only queries.

use clap::Args;
use referral_core::TreeNode;
use referral_core::db::scope::ReadScope;
use std::io::{self, Write};

use super::Context;
use crate::output::{pretty_kv, render};

#[derive(Args, Debug)]
pub struct PairArgs {
    /// Upper user (sponsor or ancestor).
    pub upper: String,
    /// Lower user (referred user or candidate descendant).
    pub lower: String,
}

#[derive(Args, Debug)]
pub struct UserArgs {
    pub user_id: String,
}

#[derive(Args, Debug)]
pub struct TreeArgs {
    /// Root of the projection.
    pub root: String,
    /// Levels to load below the root (at most 3).
    #[arg(long)]
    pub max_level: Option<u8>,
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

pub fn run_can_add(args: &PairArgs, ctx: &Context) -> anyhow::Result<()> {
    let allowed = ctx.engine().can_add_referral(&args.upper, &args.lower)?;
    let value = serde_json::json!({
        "root_user_id": args.upper,
        "referred_user_id": args.lower,
        "allowed": allowed,
    });
    render(ctx.output, &value, |_, w| writeln!(w, "{}", yes_no(allowed)))
}

pub fn run_is_descendant(args: &PairArgs, ctx: &Context) -> anyhow::Result<()> {
    let descendant = ctx.engine().is_descendant(&args.upper, &args.lower)?;
    let value = serde_json::json!({
        "ancestor_id": args.upper,
        "candidate_id": args.lower,
        "is_descendant": descendant,
    });
    render(ctx.output, &value, |_, w| writeln!(w, "{}", yes_no(descendant)))
}

pub fn run_downlines(args: &UserArgs, ctx: &Context) -> anyhow::Result<()> {
    let downlines = ctx.engine().get_direct_downlines(&args.user_id)?;
    render(ctx.output, &downlines, |nodes, w| {
        if nodes.is_empty() {
            return writeln!(w, "{} has no direct referrals", args.user_id);
        }
        for node in nodes {
            writeln!(
                w,
                "{:<20} direct={:<4} commission={}%{}",
                node.user_id,
                node.direct_referrals,
                node.commission_percent,
                if node.is_active { "" } else { " (inactive)" }
            )?;
        }
        Ok(())
    })
}

pub fn run_upline(args: &UserArgs, ctx: &Context) -> anyhow::Result<()> {
    let engine = ctx.engine();
    let snapshot = ReadScope::begin(&ctx.conn)?;
    let parent = engine.get_parent(&args.user_id)?;
    let rows = engine.get_upline(&args.user_id)?;
    snapshot.finish()?;
    let value = serde_json::json!({
        "user_id": args.user_id,
        "parent_user_id": parent,
        "ancestors": rows,
    });
    render(ctx.output, &value, |_, w| {
        pretty_kv(w, "parent", parent.as_deref().unwrap_or("(root)"))?;
        for row in &rows {
            pretty_kv(w, &format!("level {}", row.level), &row.root_user_id)?;
        }
        Ok(())
    })
}

pub fn run_tree(args: &TreeArgs, ctx: &Context) -> anyhow::Result<()> {
    let max_level = args.max_level.or(Some(ctx.config.tree.default_max_level));
    let tree = ctx.engine().get_tree_structure(&args.root, max_level)?;
    render(ctx.output, &tree, |t, w| {
        write_node(&t.root, w, "", true, true)?;
        let meta = &t.metadata;
        writeln!(
            w,
            "{} nodes, depth {}/{}{}",
            meta.total_nodes,
            meta.max_depth,
            meta.requested_depth,
            if meta.is_complete { "" } else { ", more below" }
        )?;
        if meta.skipped_rows > 0 {
            writeln!(w, "{} inconsistent rows skipped; run `refer verify`", meta.skipped_rows)?;
        }
        Ok(())
    })
}

fn write_node(
    node: &TreeNode,
    w: &mut dyn Write,
    prefix: &str,
    last: bool,
    is_root: bool,
) -> io::Result<()> {
    let label = format!(
        "{} [{} direct, {} below]",
        node.user_id, node.direct_referrals, node.total_descendants
    );
    let child_prefix = if is_root {
        writeln!(w, "{label}")?;
        String::new()
    } else {
        writeln!(w, "{prefix}{}{label}", if last { "└── " } else { "├── " })?;
        format!("{prefix}{}", if last { "    " } else { "│   " })
    };
    let count = node.children.len();
    for (i, child) in node.children.iter().enumerate() {
        write_node(child, w, &child_prefix, i + 1 == count, false)?;
    }
    Ok(())
}
