//! Shared output layer for human/JSON parity across all CLI commands.
//!
//! Every command handler receives an [`OutputMode`] and formats its result
//! accordingly. Errors go to stderr through [`render_error`] in the same mode.

use referral_core::{ErrorCode, HierarchyError};
use serde::Serialize;
use std::io::{self, Write};

/// Exit status for rejected operations (unknown user, conflict, cycle).
pub const EXIT_REJECTED: i32 = 2;
/// Exit status for infrastructure failures.
pub const EXIT_FAILURE: i32 = 1;

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<12} {}", format!("{key}:"), value.as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Render a serializable value to stdout, using `human_fn` outside JSON mode.
pub fn render<T: Serialize>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if mode.is_json() {
        serde_json::to_writer_pretty(&mut out, value)?;
        writeln!(out)?;
    } else {
        human_fn(value, &mut out)?;
    }
    Ok(())
}

/// A structured error with an error code, optional hint, and exit status.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct CliError {
    pub message: String,
    /// Stable `E####` code.
    pub error_code: &'static str,
    /// One-line description of the code.
    pub summary: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<&'static str>,
    #[serde(skip)]
    pub exit_code: i32,
}

impl CliError {
    pub fn new(code: ErrorCode, message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            error_code: code.code(),
            summary: code.message(),
            suggestion: code.hint(),
            exit_code,
        }
    }

    pub fn from_hierarchy(err: &HierarchyError) -> Self {
        let exit_code = if err.is_recoverable() {
            EXIT_REJECTED
        } else {
            EXIT_FAILURE
        };
        Self::new(err.code(), format!("{err:#}"), exit_code)
    }

    /// Classify any command failure.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(cli) = err.downcast_ref::<Self>() {
            return cli.clone();
        }
        if let Some(typed) = err.downcast_ref::<HierarchyError>() {
            return Self::from_hierarchy(typed);
        }
        Self::new(ErrorCode::InternalUnexpected, format!("{err:#}"), EXIT_FAILURE)
    }
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({ "error": error });
            serde_json::to_writer_pretty(&mut out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Human => {
            writeln!(
                out,
                "error[{}] {}: {}",
                error.error_code, error.summary, error.message
            )?;
            if let Some(suggestion) = error.suggestion {
                writeln!(out, "  hint: {suggestion}")?;
            }
        }
    }
    Ok(())
}
