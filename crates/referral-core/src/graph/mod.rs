//! Relational operations over the referral tree.
//!
//! ## Submodules
//!
//! - [`engine`]: Upline reads, cycle checks, and the mutations that rewrite
//!   closure rows for a moved subtree.
//! - [`tree`]: Nested projection of the rows under one root.
//! - [`verify`]: Consistency check between uplines and closure rows.

pub mod engine;
pub mod tree;
pub mod verify;
