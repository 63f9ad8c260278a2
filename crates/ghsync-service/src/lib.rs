//! Synchronization and caching of GitHub profile data.
//!
//! The crate keeps locally cached user and repository data fresh while shielding the GitHub
//! API from duplicate and excessive calls. See the [`caching`] module for the cache layers and
//! request coalescing, and [`sync`] for the read-through / write-through policy on top.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod sync;
pub mod types;
pub mod utils;
