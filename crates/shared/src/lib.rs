#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Workbridge Shared Types and Utilities
//!
//! Domain types and database helpers shared across the Workbridge platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
