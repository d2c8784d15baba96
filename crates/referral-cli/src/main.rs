#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, EXIT_FAILURE, OutputMode, render_error};
use referral_core::ErrorCode;
use referral_core::config::load_config;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "refer: referral upline hierarchy with a bounded closure index",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Store path (overrides config and REFERRAL_DB).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Config file (default: ./referral.toml, then the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity recorded in the audit columns of rewritten rows.
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Mutations",
        about = "Register a parentless user",
        after_help = "EXAMPLES:\n    refer register alice"
    )]
    Register(cmd::mutate::RegisterArgs),

    #[command(
        next_help_heading = "Mutations",
        about = "Place a newly referred user under its sponsor",
        after_help = "EXAMPLES:\n    refer add alice bob\n\n    refer add alice bob --json"
    )]
    Add(cmd::mutate::AddArgs),

    #[command(
        next_help_heading = "Mutations",
        about = "Attach a parentless user (and its downline) under a parent",
        after_help = "EXAMPLES:\n    refer assign carol alice"
    )]
    Assign(cmd::mutate::AttachArgs),

    #[command(
        next_help_heading = "Mutations",
        about = "Move a user and its whole downline under a new parent",
        after_help = "EXAMPLES:\n    refer move carol bob"
    )]
    Move(cmd::mutate::AttachArgs),

    #[command(
        next_help_heading = "Mutations",
        about = "Remove a user, promoting its direct referrals to its upline",
        after_help = "EXAMPLES:\n    refer promote carol --by support"
    )]
    Promote(cmd::mutate::PromoteArgs),

    #[command(
        next_help_heading = "Mutations",
        about = "Cut a user loose from its upline, keeping its downline",
        after_help = "EXAMPLES:\n    refer detach carol"
    )]
    Detach(cmd::mutate::DetachArgs),

    #[command(
        next_help_heading = "Read",
        about = "Check whether a user may be placed under a sponsor",
        after_help = "EXAMPLES:\n    refer can-add alice bob"
    )]
    CanAdd(cmd::query::PairArgs),

    #[command(
        next_help_heading = "Read",
        about = "Check whether the second user is below the first at any depth",
        after_help = "EXAMPLES:\n    refer is-descendant alice dave"
    )]
    IsDescendant(cmd::query::PairArgs),

    #[command(
        next_help_heading = "Read",
        about = "List a user's direct referrals",
        after_help = "EXAMPLES:\n    refer downlines alice --json"
    )]
    Downlines(cmd::query::UserArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show a user's parent and materialized ancestors",
        after_help = "EXAMPLES:\n    refer upline dave"
    )]
    Upline(cmd::query::UserArgs),

    #[command(
        next_help_heading = "Read",
        about = "Render the tree under a user (up to 3 levels)",
        after_help = "EXAMPLES:\n    refer tree alice\n\n    refer tree alice --max-level 1 --json"
    )]
    Tree(cmd::query::TreeArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Check the closure index against the upline list"
    )]
    Verify,

    #[command(
        next_help_heading = "Maintenance",
        about = "Re-derive the closure index from the upline list"
    )]
    Rebuild,
}

/// Default filter when `REFERRAL_LOG` is unset. The library logs under
/// `referral_core`, the binary under `refer`.
const fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "referral=debug,refer=debug,info"
    } else {
        "referral=info,refer=info,warn"
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("REFERRAL_LOG").unwrap_or_else(|_| {
        EnvFilter::new(default_filter(verbose || env::var("DEBUG").is_ok()))
    });

    let format = env::var("REFERRAL_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let output = cli.output_mode();
    let config = load_config(cli.config.as_deref()).map_err(|e| {
        CliError::new(ErrorCode::ConfigParseError, format!("{e:#}"), EXIT_FAILURE)
    })?;
    let ctx = cmd::Context::open(config, cli.db, output, cli.actor).map_err(|e| {
        CliError::new(ErrorCode::StoreUnavailable, format!("{e:#}"), EXIT_FAILURE)
    })?;
    debug!(path = %ctx.config.store.path.display(), "store ready");

    match &cli.command {
        Commands::Register(args) => cmd::mutate::run_register(args, &ctx),
        Commands::Add(args) => cmd::mutate::run_add(args, &ctx),
        Commands::Assign(args) => cmd::mutate::run_assign(args, &ctx),
        Commands::Move(args) => cmd::mutate::run_move(args, &ctx),
        Commands::Promote(args) => cmd::mutate::run_promote(args, &ctx),
        Commands::Detach(args) => cmd::mutate::run_detach(args, &ctx),
        Commands::CanAdd(args) => cmd::query::run_can_add(args, &ctx),
        Commands::IsDescendant(args) => cmd::query::run_is_descendant(args, &ctx),
        Commands::Downlines(args) => cmd::query::run_downlines(args, &ctx),
        Commands::Upline(args) => cmd::query::run_upline(args, &ctx),
        Commands::Tree(args) => cmd::query::run_tree(args, &ctx),
        Commands::Verify => cmd::maintain::run_verify(&ctx),
        Commands::Rebuild => cmd::maintain::run_rebuild(&ctx),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = cli.output_mode();

    if let Err(err) = run(cli) {
        let failure = CliError::from_anyhow(&err);
        render_error(output, &failure)?;
        io::stdout().flush()?;
        std::process::exit(failure.exit_code);
    }
    Ok(())
}
