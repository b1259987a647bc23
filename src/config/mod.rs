//! # Configuration Module
//!
//! This module centralizes all configuration constants for the block engine.
//! Constants are grouped by their functional area and interdependencies are
//! documented and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Several constants here are load-bearing for the on-disk block image: the
//! block size, the tuple header width and the string-ref width together
//! determine byte offsets that must be identical between the process that
//! spilled a block and the process that reloads it. Co-locating them with
//! compile-time checks prevents the constants from drifting apart.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency notes

pub mod constants;
pub use constants::*;
