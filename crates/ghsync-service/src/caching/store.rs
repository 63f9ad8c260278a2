use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};

use crate::config::{CacheConfig, Config};

use super::fs::FsBackend;
use super::memory::MemoryBackend;
use super::{CacheContents, CacheKey, CacheName};

/// A cached value, stamped with the time it was inserted.
#[derive(Debug)]
pub struct CacheEntry<T> {
    key: CacheKey,
    value: Arc<T>,
    inserted_at: DateTime<Utc>,
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
        }
    }
}

impl<T> CacheEntry<T> {
    /// Creates an entry inserted right now.
    pub fn new(key: CacheKey, value: Arc<T>) -> Self {
        Self::with_inserted_at(key, value, Utc::now())
    }

    /// Creates an entry with an explicit insertion time.
    ///
    /// This is used when hydrating the cache from permanent storage, where the entry is stamped
    /// with the time the value was last synchronized.
    pub fn with_inserted_at(key: CacheKey, value: Arc<T>, inserted_at: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            inserted_at,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    pub fn inserted_at(&self) -> DateTime<Utc> {
        self.inserted_at
    }

    /// The age of the entry at `now`, zero for entries stamped in the future.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        age_at(self.inserted_at, now)
    }

    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// Whether the entry is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

fn age_at(inserted_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - inserted_at).to_std().unwrap_or_default()
}

/// The mechanism holding the entries of one [`CacheStore`].
///
/// Backends are synchronous. All operations may fail with a
/// [`CacheError`](super::CacheError), which callers treat as a cache miss.
pub trait CacheBackend<T>: Send + Sync {
    /// Returns the entry stored under `key`, regardless of its age.
    fn get(&self, key: &CacheKey) -> CacheContents<Option<CacheEntry<T>>>;

    /// Inserts or replaces the entry under its key.
    fn insert(&self, entry: CacheEntry<T>) -> CacheContents;

    /// Removes the entry under `key`, returning whether one existed.
    fn invalidate(&self, key: &CacheKey) -> CacheContents<bool>;

    /// Removes all entries inserted before `cutoff`, returning how many were removed.
    ///
    /// An entry replaced by a newer insert while this runs should survive.
    fn remove_inserted_before(&self, cutoff: DateTime<Utc>) -> CacheContents<usize>;

    /// Returns the insertion times of all entries currently present.
    fn insertion_times(&self) -> CacheContents<Vec<DateTime<Utc>>>;
}

/// Summary statistics of a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub name: String,
    pub total_entries: usize,
    #[serde(rename = "oldestEntryAgeMs", serialize_with = "serialize_millis")]
    pub oldest_entry_age: Option<Duration>,
    #[serde(rename = "newestEntryAgeMs", serialize_with = "serialize_millis")]
    pub newest_entry_age: Option<Duration>,
}

impl CacheStats {
    pub fn from_insertion_times(
        name: impl Into<String>,
        times: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> Self {
        let oldest = times.iter().min().map(|t| age_at(*t, now));
        let newest = times.iter().max().map(|t| age_at(*t, now));
        Self {
            name: name.into(),
            total_entries: times.len(),
            oldest_entry_age: oldest,
            newest_entry_age: newest,
        }
    }

    /// Folds the statistics of another cache into these.
    pub fn merge(&mut self, other: &CacheStats) {
        self.total_entries += other.total_entries;
        self.oldest_entry_age = self.oldest_entry_age.max(other.oldest_entry_age);
        self.newest_entry_age = match (self.newest_entry_age, other.newest_entry_age) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

fn serialize_millis<S: Serializer>(age: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match age {
        Some(age) => s.serialize_some(&(age.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

/// A keyed store of [`CacheEntry`] values of one entity kind.
///
/// The store records access metrics and timestamps insertions. It never fails reads: callers
/// receive a [`CacheContents`] and decide whether to fail open.
pub struct CacheStore<T> {
    name: CacheName,
    backend: Box<dyn CacheBackend<T>>,
}

impl<T> fmt::Debug for CacheStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> CacheStore<T> {
    pub fn new(name: CacheName, backend: Box<dyn CacheBackend<T>>) -> Self {
        Self { name, backend }
    }

    /// Creates a store held in memory with the given capacity.
    pub fn in_memory(name: CacheName, capacity: u64) -> Self {
        Self::new(name, Box::new(MemoryBackend::new(capacity)))
    }

    /// Creates a store according to the configuration.
    ///
    /// Entries are persisted as files below the configured `cache_dir`, otherwise held in memory.
    pub fn from_config(
        name: CacheName,
        config: &Config,
        cache_config: CacheConfig,
    ) -> std::io::Result<Self>
    where
        T: Serialize + DeserializeOwned,
    {
        match (config.cache_dir(name.as_ref()), config.cache_dir("tmp")) {
            (Some(cache_dir), Some(tmp_dir)) => Ok(Self::new(
                name,
                Box::new(FsBackend::new(cache_dir, tmp_dir)?),
            )),
            _ => Ok(Self::in_memory(name, cache_config.in_memory_capacity)),
        }
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Looks up the entry for `key`, regardless of its age.
    pub fn get(&self, key: &CacheKey) -> CacheContents<Option<CacheEntry<T>>> {
        metric!(counter("caches.access") += 1, "cache" => self.name.as_ref());
        let entry = self.backend.get(key)?;
        if entry.is_some() {
            metric!(counter("caches.hit") += 1, "cache" => self.name.as_ref());
        }
        Ok(entry)
    }

    /// Stores `value` under `key`, stamped with the current time, and returns the new entry.
    pub fn set(&self, key: CacheKey, value: Arc<T>) -> CacheContents<CacheEntry<T>> {
        let entry = CacheEntry::new(key, value);
        self.put(entry.clone())?;
        Ok(entry)
    }

    /// Stores a prepared entry, keeping its insertion time.
    pub fn put(&self, entry: CacheEntry<T>) -> CacheContents {
        metric!(counter("caches.insert") += 1, "cache" => self.name.as_ref());
        self.backend.insert(entry)
    }

    pub fn invalidate(&self, key: &CacheKey) -> CacheContents<bool> {
        self.backend.invalidate(key)
    }

    /// Removes every entry whose age exceeds `max_age`, returning the number removed.
    pub fn cleanup_old_entries(&self, max_age: Duration) -> CacheContents<usize> {
        let now = Utc::now();
        let cutoff = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|max_age| now.checked_sub_signed(max_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let removed = self.backend.remove_inserted_before(cutoff)?;
        metric!(counter("caches.cleanup.removed") += removed as i64, "cache" => self.name.as_ref());
        Ok(removed)
    }

    pub fn stats(&self) -> CacheContents<CacheStats> {
        let times = self.backend.insertion_times()?;
        let stats = CacheStats::from_insertion_times(self.name.as_ref(), &times, Utc::now());
        metric!(gauge("caches.size.entries") = stats.total_entries as u64, "cache" => self.name.as_ref());
        Ok(stats)
    }
}
