//! Scope accounting engine.
//!
//! This module contains:
//! - `account`: per-scope usage counters and limit checks
//! - `scope`: named scopes, chain reservation, and migration

pub mod account;
#[allow(clippy::module_inception)]
pub mod scope;

// Re-export the core types
pub use account::{
    Direction, Resources, ScopeStat, PRIORITY_ALWAYS, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MEDIUM,
};
pub use scope::{migrate, release_chain, reserve_chain, Scope, ScopeName};
