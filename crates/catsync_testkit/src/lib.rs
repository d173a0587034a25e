//! # catsync testkit
//!
//! Test utilities for catsync.
//!
//! This crate provides:
//! - An engine harness over the in-memory store and the mock remote
//! - Fast engine configurations for tests
//! - Property-based generators for field maps and candidates
//! - Concurrency stress helpers for staging and approval
//!
//! ## Usage
//!
//! ```rust,ignore
//! use catsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn price_change_applies() {
//!     let harness = TestHarness::new();
//!     let mug = harness.seed_product("MUG-1", 10.0);
//!     harness.stage_and_approve(mug, price(12.0));
//!     let batches = harness.sync_all().await;
//!     assert_eq!(batches[0].stats.succeeded, 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
