#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! pixquota Shared Types and Utilities
//!
//! This crate contains identifier types, validation errors and database helpers shared by
//! the billing engine and the worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
