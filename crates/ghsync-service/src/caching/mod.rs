//! Caching of GitHub entities and coalescing of the fetches that fill the caches.
//!
//! # Layers
//!
//! Every entity kind (user profiles, repository lists and derived tech stats) has its own
//! [`CacheStore`]. A store is a keyed collection of [`CacheEntry`] values, each stamped with the
//! time it was inserted. The store does not expire entries on its own: presence of an entry does
//! not imply that it is fresh. The synchronizer decides freshness by comparing the entry age
//! against the TTL configured for the kind, and only age-based [cleanup](Caches::cleanup_old_entries)
//! or explicit invalidation remove entries.
//!
//! Stores are backed by one of two [`CacheBackend`]s:
//!
//! - [`MemoryBackend`], a bounded in-memory cache. This is used when no `cache_dir` is
//!   configured.
//! - [`FsBackend`], one JSON file per entry below `<cache_dir>/<cache name>/`. File names are
//!   derived from a hash of the [`CacheKey`], in the form `aa/bbccdd/eeff...`. New entries are
//!   written to `<cache_dir>/tmp` first and then atomically moved into place. The `tmp`
//!   directory is cleared on startup.
//!
//! Backend failures are surfaced as [`CacheError`] and treated as a cache miss by callers.
//!
//! # Coalescing
//!
//! [`PendingOperations`] makes sure that only one fetch for a given key is in flight at any
//! time. Concurrent callers for the same key attach to the running operation and all of them
//! receive a clone of its result, whether that is a value or an error. Once the operation
//! settles it is forgotten, nothing about failures is remembered.
//!
//! # Metrics
//!
//! - `caches.access`, `caches.hit` and `caches.insert` count store operations.
//! - `caches.cleanup.removed` counts entries removed by age-based cleanup.
//! - `caches.size.entries` is reported whenever stats are computed.
//! - `pending.started`, `pending.coalesced`, `pending.timed_out` and `pending.restarted` count
//!   coalescing decisions, `pending.count` is the number of operations in flight.
//!
//! All of these are tagged with the `cache` name.

use std::io;

use crate::config::Config;
use crate::types::{GitHubRepo, GitHubUser, TechStats};

mod cache_error;
mod cache_key;
mod cleanup;
mod config;
mod fs;
mod memory;
mod pending;
mod store;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::CacheKey;
pub use cleanup::{CachesStats, CleanupReport, cleanup};
pub use config::CacheName;
pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use pending::{Generation, Outcome, PendingOperations};
pub use store::{CacheBackend, CacheEntry, CacheStats, CacheStore};

/// All the caches, one per entity kind.
#[derive(Debug)]
pub struct Caches {
    pub users: CacheStore<GitHubUser>,
    pub repos: CacheStore<Vec<GitHubRepo>>,
    pub tech_stats: CacheStore<TechStats>,
}

impl Caches {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let caches = &config.caches;
        Ok(Self {
            users: CacheStore::from_config(CacheName::Users, config, caches.users)?,
            repos: CacheStore::from_config(CacheName::Repos, config, caches.repos)?,
            tech_stats: CacheStore::from_config(CacheName::TechStats, config, caches.tech_stats)?,
        })
    }
}

#[cfg(test)]
mod tests;
