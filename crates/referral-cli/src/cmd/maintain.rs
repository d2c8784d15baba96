//! `refer verify|rebuild`: closure index maintenance.

use chrono::{DateTime, Utc};
use referral_core::{ErrorCode, verify_closure};

use super::Context;
use crate::output::{CliError, EXIT_REJECTED, pretty_kv, render};

pub fn run_verify(ctx: &Context) -> anyhow::Result<()> {
    let report = verify_closure(&ctx.conn)?;
    render(ctx.output, &report, |r, w| {
        pretty_kv(w, "members", r.members.to_string())?;
        pretty_kv(w, "rows", r.rows.to_string())?;
        pretty_kv(
            w,
            "rebuilt",
            r.last_rebuild_at_us.map_or_else(|| "never".to_string(), micros_to_rfc3339),
        )?;
        if r.is_clean() {
            return writeln!(w, "closure index is consistent");
        }
        for violation in &r.violations {
            writeln!(w, "  {violation}")?;
        }
        Ok(())
    })?;

    if report.is_clean() {
        Ok(())
    } else {
        Err(CliError::new(
            ErrorCode::CorruptClosure,
            format!("{} closure violations", report.violations.len()),
            EXIT_REJECTED,
        )
        .into())
    }
}

pub fn run_rebuild(ctx: &Context) -> anyhow::Result<()> {
    let written = ctx.engine().rebuild_closure()?;
    let value = serde_json::json!({ "rows_written": written });
    render(ctx.output, &value, |_, w| writeln!(w, "rebuilt closure index: {written} rows"))
}

fn micros_to_rfc3339(us: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(us)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| us.to_string())
}
