//! Subcommand handlers.
//!
//! Each handler takes a [`Context`] holding the open store, the loaded
//! configuration, and the output mode.

pub mod maintain;
pub mod mutate;
pub mod query;

use anyhow::Context as _;
use referral_core::ReferralEngine;
use referral_core::config::ReferralConfig;
use referral_core::db::open_store;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::output::OutputMode;

pub struct Context {
    pub conn: Connection,
    pub config: ReferralConfig,
    pub output: OutputMode,
    pub actor: Option<String>,
}

impl Context {
    /// Open the store named by `db_override`, or by the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or migrated.
    pub fn open(
        mut config: ReferralConfig,
        db_override: Option<PathBuf>,
        output: OutputMode,
        actor: Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(path) = db_override {
            config.store.path = path;
        }
        let conn = open_store(&config.store.path, config.store.busy_timeout())
            .with_context(|| format!("open store {}", config.store.path.display()))?;
        Ok(Self {
            conn,
            config,
            output,
            actor,
        })
    }

    /// Engine bound to this context's store, commission schedule and actor.
    pub fn engine(&self) -> ReferralEngine<'_> {
        let engine =
            ReferralEngine::new(&self.conn).with_commission(self.config.commission.clone());
        match &self.actor {
            Some(actor) => engine.acting_as(actor.clone()),
            None => engine,
        }
    }
}
