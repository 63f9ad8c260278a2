//! Read-through / write-through synchronization of GitHub profiles.
//!
//! The [`Synchronizer`] serves user profiles and repositories from the caches while they are
//! fresh, and otherwise fetches them from the [`ProfileSource`]. Concurrent requests for the
//! same entity share a single fetch. A fetched value is written to the cache first and then to
//! the permanent [`ProfileStorage`]; a failure of the latter is reported alongside the value
//! instead of discarding it.
//!
//! When a fetch fails and `serve_stale_on_error` is enabled, a stale cache entry or persisted
//! record is served instead.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use serde::Serialize;

use crate::caching::{
    CacheEntry, CacheKey, CacheName, CacheStore, Caches, CachesStats, CleanupReport, Generation,
    Outcome, PendingOperations,
};
use crate::config::{CacheConfigs, Config};
use crate::types::{AccessToken, GitHubRepo, GitHubUser, Stored, TechStats, UserProfile};

mod error;
mod github;
mod storage;

pub use error::{FetchError, StorageError, SyncError};
pub use github::{GitHubClient, ProfileSource};
pub use storage::{MemoryStorage, ProfileStorage};

/// Where a returned value came from.
///
/// Ordered by how much the caller should distrust the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Served from a fresh cache entry or persisted record.
    Cache,
    /// Fetched from the source during this call, or by a concurrent call it attached to.
    Fetched,
    /// A stale cache entry or persisted record.
    Stale,
}

/// The result of a synchronization.
#[derive(Debug, Clone)]
pub struct Synced<T> {
    pub value: Arc<T>,
    pub origin: Origin,
    /// Set when the value was fetched but could not be written to permanent storage.
    pub persist_error: Option<SyncError>,
}

impl<T> Synced<T> {
    fn new(value: Arc<T>, origin: Origin) -> Self {
        Self {
            value,
            origin,
            persist_error: None,
        }
    }

    fn from_entry(entry: CacheEntry<T>, ttl: Duration) -> Self {
        let origin = if entry.is_fresh(ttl) {
            Origin::Cache
        } else {
            Origin::Stale
        };
        Self::new(entry.into_value(), origin)
    }
}

/// The shared result of one coalesced fetch.
#[derive(Debug, Clone)]
struct Fetched<T> {
    value: Arc<T>,
    persist_error: Option<SyncError>,
}

impl<T> From<Fetched<T>> for Synced<T> {
    fn from(fetched: Fetched<T>) -> Self {
        Self {
            value: fetched.value,
            origin: Origin::Fetched,
            persist_error: fetched.persist_error,
        }
    }
}

type PendingFetches<T> = PendingOperations<CacheKey, Fetched<T>, SyncError>;

/// Cache and pending operation statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    #[serde(flatten)]
    pub caches: CachesStats,
    pub pending: BTreeMap<String, usize>,
}

/// Keeps cached GitHub data fresh while shielding the API from duplicate calls.
pub struct Synchronizer {
    caches: Arc<Caches>,
    ttls: CacheConfigs,
    serve_stale_on_error: bool,
    source: Arc<dyn ProfileSource>,
    storage: Arc<dyn ProfileStorage>,
    pending_users: PendingFetches<GitHubUser>,
    pending_repos: PendingFetches<Vec<GitHubRepo>>,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("caches", &self.caches)
            .field("ttls", &self.ttls)
            .field("serve_stale_on_error", &self.serve_stale_on_error)
            .field("pending_users", &self.pending_users)
            .field("pending_repos", &self.pending_repos)
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    pub fn new(
        config: &Config,
        caches: Caches,
        source: Arc<dyn ProfileSource>,
        storage: Arc<dyn ProfileStorage>,
    ) -> Self {
        Self {
            caches: Arc::new(caches),
            ttls: config.caches.clone(),
            serve_stale_on_error: config.serve_stale_on_error,
            source,
            storage,
            pending_users: PendingOperations::new(CacheName::Users, config.pending_timeout),
            pending_repos: PendingOperations::new(CacheName::Repos, config.pending_timeout),
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Returns the profile of `login`, fetching it if the cached one is missing or stale.
    pub async fn sync_user(
        &self,
        login: &str,
        token: &AccessToken,
    ) -> Result<Synced<GitHubUser>, SyncError> {
        let key = CacheKey::user(login);
        let ttl = self.ttls.users.ttl;
        let cached = read_cache(&self.caches.users, &key);
        if let Some(entry) = cached.as_ref().filter(|entry| entry.is_fresh(ttl)) {
            return Ok(Synced::new(entry.value().clone(), Origin::Cache));
        }

        match self.fetch_user(key, token, false).await {
            Ok(fetched) => Ok(fetched.into()),
            Err(err) => self.fallback(err, cached, self.storage.user_basic(login)).await,
        }
    }

    /// Returns the repositories of `login`, fetching them if the cached ones are missing or
    /// stale. Fetching also refreshes the tech stats of the user.
    pub async fn sync_repos(
        &self,
        login: &str,
        token: &AccessToken,
    ) -> Result<Synced<Vec<GitHubRepo>>, SyncError> {
        let key = CacheKey::repos(login);
        let ttl = self.ttls.repos.ttl;
        let cached = read_cache(&self.caches.repos, &key);
        if let Some(entry) = cached.as_ref().filter(|entry| entry.is_fresh(ttl)) {
            return Ok(Synced::new(entry.value().clone(), Origin::Cache));
        }

        match self.fetch_repos(key, token, false).await {
            Ok(fetched) => Ok(fetched.into()),
            Err(err) => self.fallback(err, cached, self.storage.repos(login)).await,
        }
    }

    /// Synchronizes the user and their repositories concurrently.
    pub async fn sync_profile(
        &self,
        login: &str,
        token: &AccessToken,
    ) -> Result<Synced<UserProfile>, SyncError> {
        let (user, repos) = futures::join!(
            self.sync_user(login, token),
            self.sync_repos(login, token)
        );
        Ok(compose(user?, repos?))
    }

    /// Drops everything cached about `login` and fetches it again.
    ///
    /// Fetches already in flight for the user are superseded by new ones, as they may have
    /// started before the change that prompted the resync. Their callers still receive their
    /// results, but those are no longer written to the cache or storage. Fetch failures are not
    /// masked by stale data.
    pub async fn resync_profile(
        &self,
        login: &str,
        token: &AccessToken,
    ) -> Result<Synced<UserProfile>, SyncError> {
        let user_key = CacheKey::user(login);
        let repos_key = CacheKey::repos(login);

        invalidate(&self.caches.users, &user_key);
        invalidate(&self.caches.repos, &repos_key);
        invalidate(&self.caches.tech_stats, &CacheKey::tech_stats(login));
        if let Err(err) = self.storage.invalidate_user(login).await {
            tracing::warn!(error = %err, login, "Failed to invalidate stored profile");
        }

        let (user, repos) = futures::join!(
            self.fetch_user(user_key, token, true),
            self.fetch_repos(repos_key, token, true)
        );
        Ok(compose(user?.into(), repos?.into()))
    }

    /// Returns the cached or persisted profile of `login` without fetching.
    pub async fn user(&self, login: &str) -> Result<Synced<GitHubUser>, SyncError> {
        read_through(
            &self.caches.users,
            CacheKey::user(login),
            self.ttls.users.ttl,
            self.storage.user_basic(login),
        )
        .await
    }

    /// Returns the cached or persisted repositories of `login` without fetching.
    pub async fn repos(&self, login: &str) -> Result<Synced<Vec<GitHubRepo>>, SyncError> {
        read_through(
            &self.caches.repos,
            CacheKey::repos(login),
            self.ttls.repos.ttl,
            self.storage.repos(login),
        )
        .await
    }

    /// Returns a single repository of `login` by name, without fetching.
    pub async fn repo(&self, login: &str, name: &str) -> Result<Synced<GitHubRepo>, SyncError> {
        let ttl = self.ttls.repos.ttl;
        if let Some(entry) = read_cache(&self.caches.repos, &CacheKey::repos(login)) {
            let repos = Synced::from_entry(entry, ttl);
            let repo = repos
                .value
                .iter()
                .find(|repo| repo.name.eq_ignore_ascii_case(name))
                .ok_or(SyncError::NotFound)?;
            return Ok(Synced::new(Arc::new(repo.clone()), repos.origin));
        }

        let stored = self.storage.repo(login, name).await?;
        let stored = stored.ok_or(SyncError::NotFound)?;
        let origin = freshness(stored.synced_at, ttl);
        Ok(Synced::new(Arc::new(stored.value), origin))
    }

    /// Returns the cached or persisted tech stats of `login` without fetching.
    pub async fn tech_stats(&self, login: &str) -> Result<Synced<TechStats>, SyncError> {
        read_through(
            &self.caches.tech_stats,
            CacheKey::tech_stats(login),
            self.ttls.tech_stats.ttl,
            self.storage.tech_stats(login),
        )
        .await
    }

    /// Returns the cached or persisted full profile of `login` without fetching.
    pub async fn profile(&self, login: &str) -> Result<Synced<UserProfile>, SyncError> {
        let user = read_cache(&self.caches.users, &CacheKey::user(login));
        let repos = read_cache(&self.caches.repos, &CacheKey::repos(login));
        if let (Some(user), Some(repos)) = (user, repos) {
            return Ok(compose(
                Synced::from_entry(user, self.ttls.users.ttl),
                Synced::from_entry(repos, self.ttls.repos.ttl),
            ));
        }

        let stored = self.storage.user_full(login).await?;
        let Stored { value, synced_at } = stored.ok_or(SyncError::NotFound)?;
        let UserProfile {
            user,
            repos,
            tech_stats,
        } = value;

        let user = Arc::new(user);
        let repos = Arc::new(repos);
        hydrate(&self.caches.users, CacheKey::user(login), user.clone(), synced_at);
        hydrate(&self.caches.repos, CacheKey::repos(login), repos.clone(), synced_at);
        hydrate(
            &self.caches.tech_stats,
            CacheKey::tech_stats(login),
            Arc::new(tech_stats),
            synced_at,
        );

        Ok(compose(
            Synced::new(user, freshness(synced_at, self.ttls.users.ttl)),
            Synced::new(repos, freshness(synced_at, self.ttls.repos.ttl)),
        ))
    }

    /// Removes cache entries older than `max_age` from all caches.
    pub fn cleanup(&self, max_age: Duration) -> Result<CleanupReport, SyncError> {
        Ok(self.caches.cleanup_old_entries(max_age)?)
    }

    pub fn stats(&self) -> Result<SyncStats, SyncError> {
        let caches = self.caches.stats()?;
        let pending = BTreeMap::from([
            (CacheName::Users.to_string(), self.pending_users.pending_count()),
            (CacheName::Repos.to_string(), self.pending_repos.pending_count()),
        ]);
        Ok(SyncStats { caches, pending })
    }

    /// Number of fetches currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending_users.pending_count() + self.pending_repos.pending_count()
    }

    /// Fetches the user behind `key`, attaching to a pending fetch unless `restart` is set.
    fn fetch_user(
        &self,
        key: CacheKey,
        token: &AccessToken,
        restart: bool,
    ) -> Outcome<Fetched<GitHubUser>, SyncError> {
        let caches = Arc::clone(&self.caches);
        let source = Arc::clone(&self.source);
        let storage = Arc::clone(&self.storage);
        let token = token.clone();
        let pending_key = key.clone();

        let operation = move |generation: Generation| async move {
            let user = guarded(source.fetch_user(&token, key.id())).await?;
            let user = Arc::new(user);

            let persist_error = if generation.is_current() {
                store_fetched(&caches.users, key.clone(), user.clone());
                persisted(&key, storage.upsert_user(&user)).await
            } else {
                discard_superseded(&key);
                None
            };

            Ok(Fetched {
                value: user,
                persist_error,
            })
        };

        if restart {
            self.pending_users.restart(pending_key, operation)
        } else {
            self.pending_users.coalesce(pending_key, operation)
        }
    }

    fn fetch_repos(
        &self,
        key: CacheKey,
        token: &AccessToken,
        restart: bool,
    ) -> Outcome<Fetched<Vec<GitHubRepo>>, SyncError> {
        let caches = Arc::clone(&self.caches);
        let source = Arc::clone(&self.source);
        let storage = Arc::clone(&self.storage);
        let token = token.clone();
        let pending_key = key.clone();

        let operation = move |generation: Generation| async move {
            let login = key.id();
            let repos = guarded(source.fetch_repos(&token, login)).await?;
            let stats = TechStats::from_repos(&repos);
            let repos = Arc::new(repos);
            tracing::debug!(
                login,
                repos = repos.len(),
                language = stats.primary_language(),
                "Fetched repositories"
            );

            let persist_error = if generation.is_current() {
                store_fetched(&caches.repos, key.clone(), repos.clone());
                store_fetched(&caches.tech_stats, CacheKey::tech_stats(login), Arc::new(stats));
                persisted(&key, storage.upsert_repos(login, &repos)).await
            } else {
                discard_superseded(&key);
                None
            };

            Ok(Fetched {
                value: repos,
                persist_error,
            })
        };

        if restart {
            self.pending_repos.restart(pending_key, operation)
        } else {
            self.pending_repos.coalesce(pending_key, operation)
        }
    }

    /// Serves stale data after a failed fetch, if enabled and available.
    async fn fallback<T, F>(
        &self,
        err: SyncError,
        cached: Option<CacheEntry<T>>,
        stored: F,
    ) -> Result<Synced<T>, SyncError>
    where
        F: Future<Output = Result<Option<Stored<T>>, StorageError>>,
    {
        let recoverable = matches!(&err, SyncError::FetchFailed(e) if *e != FetchError::NotFound);
        if !self.serve_stale_on_error || !recoverable {
            return Err(err);
        }

        if let Some(entry) = cached {
            tracing::warn!(error = %err, key = %entry.key(), "Serving stale cache entry");
            metric!(counter("sync.stale_served") += 1, "from" => "cache");
            return Ok(Synced::new(entry.into_value(), Origin::Stale));
        }

        match stored.await {
            Ok(Some(stored)) => {
                tracing::warn!(error = %err, "Serving stale persisted record");
                metric!(counter("sync.stale_served") += 1, "from" => "storage");
                Ok(Synced::new(Arc::new(stored.value), Origin::Stale))
            }
            Ok(None) => Err(err),
            Err(storage_err) => {
                tracing::warn!(error = %storage_err, "Failed to read persisted record");
                Err(err)
            }
        }
    }
}

/// Reads from the cache, failing open.
fn read_cache<T: Send + Sync + 'static>(
    cache: &CacheStore<T>,
    key: &CacheKey,
) -> Option<CacheEntry<T>> {
    match cache.get(key) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::warn!(error = %err, %key, "Failed to read from cache");
            metric!(counter("sync.cache_error") += 1, "cache" => cache.name().as_ref());
            None
        }
    }
}

/// Writes a freshly fetched value to the cache, logging failures.
fn store_fetched<T: Send + Sync + 'static>(cache: &CacheStore<T>, key: CacheKey, value: Arc<T>) {
    if let Err(err) = cache.set(key, value) {
        let err = SyncError::from(err);
        tracing::warn!(error = %err, cache = %cache.name(), "Failed to write to cache");
        metric!(counter("sync.cache_error") += 1, "cache" => cache.name().as_ref());
    }
}

/// Skips the write-through of a fetch that was superseded while it ran.
fn discard_superseded(key: &CacheKey) {
    tracing::debug!(%key, "Not storing result of superseded fetch");
    metric!(counter("sync.superseded") += 1, "cache" => key.name().as_ref());
}

/// Writes a persisted value to the cache, stamped with its sync time.
fn hydrate<T: Send + Sync + 'static>(
    cache: &CacheStore<T>,
    key: CacheKey,
    value: Arc<T>,
    synced_at: DateTime<Utc>,
) {
    if let Err(err) = cache.put(CacheEntry::with_inserted_at(key, value, synced_at)) {
        tracing::warn!(error = %err, cache = %cache.name(), "Failed to hydrate cache");
    }
}

fn invalidate<T: Send + Sync + 'static>(cache: &CacheStore<T>, key: &CacheKey) {
    if let Err(err) = cache.invalidate(key) {
        tracing::warn!(error = %err, %key, "Failed to invalidate cache entry");
    }
}

/// Runs a fetch, turning a panic into an internal error.
async fn guarded<T, F>(fetch: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(result) => Ok(result?),
        Err(_) => {
            tracing::error!("Fetching from GitHub panicked");
            Err(SyncError::InternalError)
        }
    }
}

/// Awaits a storage write, returning its failure as a [`SyncError`].
async fn persisted<F>(key: &CacheKey, write: F) -> Option<SyncError>
where
    F: Future<Output = Result<(), StorageError>>,
{
    let err = write.await.err()?;
    tracing::error!(error = %err, %key, "Failed to persist fetched value");
    metric!(counter("sync.persist_failed") += 1, "cache" => key.name().as_ref());
    Some(err.into())
}

async fn read_through<T, F>(
    cache: &CacheStore<T>,
    key: CacheKey,
    ttl: Duration,
    stored: F,
) -> Result<Synced<T>, SyncError>
where
    T: Send + Sync + 'static,
    F: Future<Output = Result<Option<Stored<T>>, StorageError>>,
{
    if let Some(entry) = read_cache(cache, &key) {
        return Ok(Synced::from_entry(entry, ttl));
    }

    let Stored { value, synced_at } = stored.await?.ok_or(SyncError::NotFound)?;
    let value = Arc::new(value);
    hydrate(cache, key, value.clone(), synced_at);
    Ok(Synced::new(value, freshness(synced_at, ttl)))
}

fn freshness(synced_at: DateTime<Utc>, ttl: Duration) -> Origin {
    let age = (Utc::now() - synced_at).to_std().unwrap_or_default();
    if age < ttl {
        Origin::Cache
    } else {
        Origin::Stale
    }
}

fn compose(user: Synced<GitHubUser>, repos: Synced<Vec<GitHubRepo>>) -> Synced<UserProfile> {
    let profile = UserProfile {
        user: (*user.value).clone(),
        tech_stats: TechStats::from_repos(&repos.value),
        repos: (*repos.value).clone(),
    };
    Synced {
        value: Arc::new(profile),
        origin: user.origin.max(repos.origin),
        persist_error: user.persist_error.or(repos.persist_error),
    }
}

#[cfg(test)]
mod tests;
