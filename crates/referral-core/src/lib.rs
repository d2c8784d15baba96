//! referral-core library.
//!
//! Keeps a referral tree in SQLite as an authoritative upline list plus a
//! three-level closure index, and exposes the hierarchy operations that keep
//! the two consistent.
//!
//! # Conventions
//!
//! - **Errors**: [`HierarchyError`] at the engine boundary, `anyhow::Result`
//!   for infrastructure setup.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod config;
pub mod db;
pub mod error;
pub mod graph;

pub use error::{ErrorCode, HierarchyError};
pub use graph::engine::{DownlineNode, PromotionSummary, ReferralEngine, RewriteSummary};
pub use graph::tree::{TreeMetadata, TreeNode, TreeStructure};
pub use graph::verify::{VerifyReport, Violation, verify_closure};
