//! `refer register|add|assign|move|promote|detach`: structural mutations.

use clap::Args;
use referral_core::RewriteSummary;
use serde::Serialize;
use std::io::{self, Write};

use super::Context;
use crate::output::{pretty_kv, render};

#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// User to register as a parentless member.
    pub user_id: String,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Sponsor the new user is placed under.
    pub sponsor: String,
    /// Newly referred user.
    pub user_id: String,
}

#[derive(Args, Debug)]
pub struct AttachArgs {
    /// User (with its downline) to place.
    pub user_id: String,
    /// New upline.
    pub parent: String,
}

#[derive(Args, Debug)]
pub struct PromoteArgs {
    /// User being removed from the tree.
    pub user_id: String,
    /// Who removed the user; recorded on rewritten rows.
    #[arg(long)]
    pub by: Option<String>,
}

#[derive(Args, Debug)]
pub struct DetachArgs {
    /// User to cut loose from its upline.
    pub user_id: String,
}

#[derive(Serialize)]
struct Placement<'a> {
    user_id: &'a str,
    parent_user_id: Option<&'a str>,
    #[serde(flatten)]
    summary: RewriteSummary,
}

fn write_placement(p: &Placement<'_>, w: &mut dyn Write, verb: &str) -> io::Result<()> {
    match p.parent_user_id {
        Some(parent) => writeln!(w, "{verb} {} under {parent}", p.user_id)?,
        None => writeln!(w, "{verb} {}", p.user_id)?,
    }
    pretty_kv(w, "subtree", p.summary.subtree_size.to_string())?;
    pretty_kv(w, "rewritten", p.summary.rewritten.to_string())
}

pub fn run_register(args: &RegisterArgs, ctx: &Context) -> anyhow::Result<()> {
    let created = ctx.engine().register_user(&args.user_id)?;
    let value = serde_json::json!({ "user_id": args.user_id, "created": created });
    render(ctx.output, &value, |_, w| {
        if created {
            writeln!(w, "registered {}", args.user_id)
        } else {
            writeln!(w, "{} is already registered", args.user_id)
        }
    })
}

pub fn run_add(args: &AddArgs, ctx: &Context) -> anyhow::Result<()> {
    let summary = ctx.engine().add_referral(&args.sponsor, &args.user_id)?;
    let placement = Placement {
        user_id: &args.user_id,
        parent_user_id: Some(&args.sponsor),
        summary,
    };
    render(ctx.output, &placement, |p, w| write_placement(p, w, "added"))
}

pub fn run_assign(args: &AttachArgs, ctx: &Context) -> anyhow::Result<()> {
    let summary = ctx.engine().assign_orphan_user(&args.user_id, &args.parent)?;
    let placement = Placement {
        user_id: &args.user_id,
        parent_user_id: Some(&args.parent),
        summary,
    };
    render(ctx.output, &placement, |p, w| write_placement(p, w, "assigned"))
}

pub fn run_move(args: &AttachArgs, ctx: &Context) -> anyhow::Result<()> {
    let summary = ctx.engine().move_downline(&args.user_id, &args.parent)?;
    let placement = Placement {
        user_id: &args.user_id,
        parent_user_id: Some(&args.parent),
        summary,
    };
    render(ctx.output, &placement, |p, w| write_placement(p, w, "moved"))
}

pub fn run_promote(args: &PromoteArgs, ctx: &Context) -> anyhow::Result<()> {
    let summary = ctx
        .engine()
        .auto_promote_downlines(&args.user_id, args.by.as_deref())?;
    render(ctx.output, &summary, |s, w| {
        writeln!(w, "removed {}", s.deleted_user_id)?;
        let target = s.new_parent_id.as_deref().unwrap_or("(root)");
        if s.promoted.is_empty() {
            pretty_kv(w, "promoted", "none")?;
        } else {
            pretty_kv(w, "promoted", format!("{} -> {target}", s.promoted.join(", ")))?;
        }
        pretty_kv(w, "rewritten", s.rewrite.rewritten.to_string())
    })
}

pub fn run_detach(args: &DetachArgs, ctx: &Context) -> anyhow::Result<()> {
    let summary = ctx.engine().detach_user(&args.user_id)?;
    let placement = Placement {
        user_id: &args.user_id,
        parent_user_id: None,
        summary,
    };
    render(ctx.output, &placement, |p, w| write_placement(p, w, "detached"))
}
