use chrono::{DateTime, Utc};
use moka::ops::compute::{CompResult, Op};

use super::{CacheBackend, CacheContents, CacheEntry, CacheKey};

/// A [`CacheBackend`] holding entries in a bounded in-memory [`moka`] cache.
///
/// Entries are never expired by the in-memory cache itself. Freshness is decided by the caller
/// based on the insertion time, and old entries are only dropped by explicit cleanup or once
/// the capacity is exceeded.
pub struct MemoryBackend<T> {
    cache: moka::sync::Cache<CacheKey, CacheEntry<T>>,
}

impl<T: Send + Sync + 'static> MemoryBackend<T> {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: moka::sync::Cache::builder().max_capacity(capacity).build(),
        }
    }
}

impl<T: Send + Sync + 'static> CacheBackend<T> for MemoryBackend<T> {
    fn get(&self, key: &CacheKey) -> CacheContents<Option<CacheEntry<T>>> {
        Ok(self.cache.get(key))
    }

    fn insert(&self, entry: CacheEntry<T>) -> CacheContents {
        self.cache.insert(entry.key().clone(), entry);
        Ok(())
    }

    fn invalidate(&self, key: &CacheKey) -> CacheContents<bool> {
        Ok(self.cache.remove(key).is_some())
    }

    fn remove_inserted_before(&self, cutoff: DateTime<Utc>) -> CacheContents<usize> {
        let mut removed = 0;
        for (key, entry) in self.cache.iter() {
            if entry.inserted_at() >= cutoff {
                continue;
            }
            // Re-check under the entry lock, a concurrent insert may have replaced it.
            let result = self
                .cache
                .entry_by_ref(&*key)
                .and_compute_with(|current| match current {
                    Some(current) if current.value().inserted_at() < cutoff => Op::Remove,
                    _ => Op::Nop,
                });
            if let CompResult::Removed(_) = result {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn insertion_times(&self) -> CacheContents<Vec<DateTime<Utc>>> {
        Ok(self
            .cache
            .iter()
            .map(|(_, entry)| entry.inserted_at())
            .collect())
    }
}
