use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;

use super::{CacheContents, CacheError, CacheName, CacheStats, CacheStore, Caches};

/// Entry function for the cleanup command.
///
/// Removes entries older than `older_than` from all persistent caches, falling back to the
/// configured `cleanup_older_than`.
pub fn cleanup(config: Config, older_than: Option<Duration>) -> Result<CleanupReport> {
    anyhow::ensure!(
        config.cache_dir.is_some(),
        "no caching configured! Did you provide a path to your config file?"
    );
    let max_age = older_than.unwrap_or(config.cleanup_older_than);
    let report = Caches::from_config(&config)?.cleanup_old_entries(max_age)?;
    Ok(report)
}

/// The number of entries removed by a cleanup, in total and per cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    pub caches: BTreeMap<String, usize>,
}

/// Statistics of all caches, along with the totals across them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CachesStats {
    pub total: CacheStats,
    pub caches: BTreeMap<String, CacheStats>,
}

/// The operations on a [`CacheStore`] that do not depend on its value type.
trait AnyCacheStore {
    fn name(&self) -> CacheName;
    fn cleanup_old_entries(&self, max_age: Duration) -> CacheContents<usize>;
    fn stats(&self) -> CacheContents<CacheStats>;
}

impl<T: Send + Sync + 'static> AnyCacheStore for CacheStore<T> {
    fn name(&self) -> CacheName {
        CacheStore::name(self)
    }

    fn cleanup_old_entries(&self, max_age: Duration) -> CacheContents<usize> {
        CacheStore::cleanup_old_entries(self, max_age)
    }

    fn stats(&self) -> CacheContents<CacheStats> {
        CacheStore::stats(self)
    }
}

impl Caches {
    fn all(&self) -> [&dyn AnyCacheStore; 3] {
        // Destructure so we do not accidentally forget one of our members.
        let Self {
            users,
            repos,
            tech_stats,
        } = self;
        [users, repos, tech_stats]
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid leaving temporary files which survive a hard crash.
    pub fn clear_tmp(&self, config: &Config) -> io::Result<()> {
        if let Some(ref tmp) = config.cache_dir("tmp") {
            if tmp.exists() {
                std::fs::remove_dir_all(tmp)?;
            }
            std::fs::create_dir_all(tmp)?;
        }
        Ok(())
    }

    /// Removes all entries older than `max_age` from all caches.
    ///
    /// A failing cache does not stop the cleanup of the others, the first error is returned
    /// once all caches were processed.
    pub fn cleanup_old_entries(&self, max_age: Duration) -> Result<CleanupReport, CacheError> {
        let mut report = CleanupReport::default();
        let mut first_error = None;

        for cache in self.all() {
            tracing::info!("Cleaning up `{}` cache", cache.name());
            match cache.cleanup_old_entries(max_age) {
                Ok(removed) => {
                    tracing::info!("Removed {} entries from `{}`", removed, cache.name());
                    report.deleted += removed;
                    report.caches.insert(cache.name().to_string(), removed);
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to cleanup `{}` cache", cache.name());
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Returns statistics of every cache.
    pub fn stats(&self) -> Result<CachesStats, CacheError> {
        let mut stats = CachesStats {
            total: CacheStats {
                name: "total".into(),
                ..Default::default()
            },
            caches: BTreeMap::new(),
        };
        for cache in self.all() {
            let cache_stats = cache.stats()?;
            stats.total.merge(&cache_stats);
            stats.caches.insert(cache.name().to_string(), cache_stats);
        }
        Ok(stats)
    }
}
