use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::TimeDelta;
use futures::future::{self, BoxFuture};
use tokio::time::{sleep, timeout};

use super::*;

const DAY: Duration = Duration::from_secs(24 * 3600);

fn user(login: &str) -> GitHubUser {
    serde_json::from_value(serde_json::json!({"login": login, "id": 42})).unwrap()
}

fn repos(login: &str) -> Vec<GitHubRepo> {
    [("one", "Rust", 10), ("two", "Rust", 5), ("three", "Go", 20)]
        .into_iter()
        .enumerate()
        .map(|(id, (name, language, stars))| {
            serde_json::from_value(serde_json::json!({
                "id": id,
                "name": name,
                "full_name": format!("{login}/{name}"),
                "language": language,
                "stargazers_count": stars,
            }))
            .unwrap()
        })
        .collect()
}

/// A [`ProfileSource`] that counts its calls.
///
/// Fetched users report the number of the call as their follower count. `ghost` does not exist
/// and fetching `explode` panics.
#[derive(Default)]
struct FakeSource {
    user_calls: AtomicUsize,
    repo_calls: AtomicUsize,
    delay: Duration,
    delays: Mutex<VecDeque<Duration>>,
    failure: Mutex<Option<FetchError>>,
}

impl FakeSource {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Delays the next calls by `delays`, in order, before falling back to the default delay.
    fn delay_next(&self, delays: impl IntoIterator<Item = Duration>) {
        self.delays.lock().unwrap().extend(delays);
    }

    fn next_delay(&self) -> Duration {
        self.delays.lock().unwrap().pop_front().unwrap_or(self.delay)
    }

    fn fail_with(&self, err: FetchError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    fn user_calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
    }

    fn repo_calls(&self) -> usize {
        self.repo_calls.load(Ordering::SeqCst)
    }

    async fn respond<T>(
        &self,
        login: &str,
        delay: Duration,
        value: impl FnOnce() -> T,
    ) -> Result<T, FetchError> {
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let failure = self.failure.lock().unwrap().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        match login {
            "ghost" => Err(FetchError::NotFound),
            "explode" => panic!("source exploded"),
            _ => Ok(value()),
        }
    }
}

impl ProfileSource for FakeSource {
    fn fetch_user<'a>(
        &'a self,
        _token: &'a AccessToken,
        login: &'a str,
    ) -> BoxFuture<'a, Result<GitHubUser, FetchError>> {
        let call = self.user_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.next_delay();
        self.respond(login, delay, move || GitHubUser {
            followers: call as u32,
            ..user(login)
        })
        .boxed()
    }

    fn fetch_repos<'a>(
        &'a self,
        _token: &'a AccessToken,
        login: &'a str,
    ) -> BoxFuture<'a, Result<Vec<GitHubRepo>, FetchError>> {
        self.repo_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.next_delay();
        self.respond(login, delay, || repos(login)).boxed()
    }
}

/// A [`MemoryStorage`] whose writes can be made to fail.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
    fail_writes: AtomicBool,
}

impl FlakyStorage {
    fn write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError("disk full".into()))
        } else {
            Ok(())
        }
    }
}

type StorageResult<T> = Result<T, StorageError>;

impl ProfileStorage for FlakyStorage {
    fn user_basic<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<GitHubUser>>>> {
        self.inner.user_basic(login)
    }

    fn user_full<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<UserProfile>>>> {
        self.inner.user_full(login)
    }

    fn repos<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<Vec<GitHubRepo>>>>> {
        self.inner.repos(login)
    }

    fn repo<'a>(
        &'a self,
        login: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<GitHubRepo>>>> {
        self.inner.repo(login, name)
    }

    fn tech_stats<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<TechStats>>>> {
        self.inner.tech_stats(login)
    }

    fn upsert_user<'a>(&'a self, user: &'a GitHubUser) -> BoxFuture<'a, StorageResult<()>> {
        match self.write() {
            Ok(()) => self.inner.upsert_user(user),
            Err(err) => future::err(err).boxed(),
        }
    }

    fn upsert_repos<'a>(
        &'a self,
        login: &'a str,
        repos: &'a [GitHubRepo],
    ) -> BoxFuture<'a, StorageResult<()>> {
        match self.write() {
            Ok(()) => self.inner.upsert_repos(login, repos),
            Err(err) => future::err(err).boxed(),
        }
    }

    fn invalidate_user<'a>(&'a self, login: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        self.inner.invalidate_user(login)
    }
}

struct Setup {
    sync: Synchronizer,
    source: Arc<FakeSource>,
    storage: Arc<FlakyStorage>,
}

fn setup_with(config: Config, source: FakeSource) -> Setup {
    ghsync_test::setup();
    let source = Arc::new(source);
    let storage = Arc::new(FlakyStorage::default());
    let caches = Caches::from_config(&config).unwrap();
    let sync = Synchronizer::new(&config, caches, source.clone(), storage.clone());
    Setup {
        sync,
        source,
        storage,
    }
}

fn setup() -> Setup {
    setup_with(Config::default(), FakeSource::default())
}

fn token() -> AccessToken {
    AccessToken::new("ghp_test")
}

fn aged_user(login: &str, age: Duration) -> CacheEntry<GitHubUser> {
    let inserted_at = Utc::now() - TimeDelta::from_std(age).unwrap();
    CacheEntry::with_inserted_at(CacheKey::user(login), Arc::new(user(login)), inserted_at)
}

#[tokio::test]
async fn test_fresh_entry_is_served_from_cache() {
    let Setup { sync, source, .. } = setup();

    let first = sync.sync_user("alice", &token()).await.unwrap();
    assert_eq!(first.origin, Origin::Fetched);
    assert_eq!(first.value.login, "alice");

    let second = sync.sync_user("Alice", &token()).await.unwrap();
    assert_eq!(second.origin, Origin::Cache);
    assert_eq!(second.value, first.value);
    assert_eq!(source.user_calls(), 1);
}

#[tokio::test]
async fn test_stale_entry_is_refetched() {
    let mut config = Config::default();
    config.caches.users.ttl = DAY;
    let Setup { sync, source, .. } = setup_with(config, FakeSource::default());

    sync.caches()
        .users
        .put(aged_user("alice", 31 * DAY))
        .unwrap();

    let synced = sync.sync_user("alice", &token()).await.unwrap();
    assert_eq!(synced.origin, Origin::Fetched);
    assert_eq!(source.user_calls(), 1);

    let entry = sync.caches().users.get(&CacheKey::user("alice")).unwrap();
    assert!(entry.unwrap().is_fresh(DAY));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_syncs_share_one_fetch() {
    let Setup { sync, source, .. } = setup_with(
        Config::default(),
        FakeSource::with_delay(Duration::from_millis(200)),
    );
    let token = token();

    let results = future::join_all((0..10).map(|_| sync.sync_user("alice", &token))).await;

    for result in results {
        let synced = result.unwrap();
        assert_eq!(synced.origin, Origin::Fetched);
        assert_eq!(synced.value.login, "alice");
    }
    assert_eq!(source.user_calls(), 1);
    assert_eq!(sync.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_sync_still_completes() {
    let Setup {
        sync,
        source,
        storage,
    } = setup_with(
        Config::default(),
        FakeSource::with_delay(Duration::from_millis(200)),
    );

    let abandoned = timeout(Duration::from_millis(50), sync.sync_user("alice", &token())).await;
    assert!(abandoned.is_err());
    assert_eq!(sync.pending_count(), 1);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(sync.pending_count(), 0);
    assert_eq!(source.user_calls(), 1);
    assert!(sync.caches().users.get(&CacheKey::user("alice")).unwrap().is_some());
    assert!(storage.user_basic("alice").await.unwrap().is_some());

    let synced = sync.sync_user("alice", &token()).await.unwrap();
    assert_eq!(synced.origin, Origin::Cache);
    assert_eq!(source.user_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_fetch_does_not_overwrite_newer_result() {
    let config = Config {
        pending_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let Setup {
        sync,
        source,
        storage,
    } = setup_with(config, FakeSource::default());
    source.delay_next([Duration::from_secs(10)]);
    let token = token();

    let (slow, fast) = futures::join!(sync.sync_user("alice", &token), async {
        sleep(Duration::from_secs(2)).await;
        sync.sync_user("alice", &token).await
    });

    // Both callers get the result of the fetch they attached to.
    let (slow, fast) = (slow.unwrap(), fast.unwrap());
    assert_eq!(slow.value.followers, 1);
    assert_eq!(fast.value.followers, 2);
    assert_eq!(source.user_calls(), 2);
    assert_eq!(sync.pending_count(), 0);

    // Only the newer result was written through.
    let synced = sync.sync_user("alice", &token).await.unwrap();
    assert_eq!(synced.origin, Origin::Cache);
    assert_eq!(synced.value.followers, 2);
    let stored = storage.user_basic("alice").await.unwrap().unwrap();
    assert_eq!(stored.value.followers, 2);
}

#[tokio::test]
async fn test_failure_is_not_cached() {
    let Setup { sync, source, .. } = setup();
    let rate_limited = FetchError::RateLimited { reset_at: None };
    source.fail_with(rate_limited.clone());

    for _ in 0..2 {
        let err = sync.sync_user("alice", &token()).await.unwrap_err();
        assert_eq!(err, SyncError::FetchFailed(rate_limited.clone()));
    }
    assert_eq!(source.user_calls(), 2);
    assert!(sync.caches().users.get(&CacheKey::user("alice")).unwrap().is_none());
}

#[tokio::test]
async fn test_stale_cache_entry_served_on_error() {
    let Setup { sync, source, .. } = setup();
    sync.caches()
        .users
        .put(aged_user("alice", 31 * DAY))
        .unwrap();
    source.fail_with(FetchError::Timeout(Duration::from_secs(30)));

    let synced = sync.sync_user("alice", &token()).await.unwrap();
    assert_eq!(synced.origin, Origin::Stale);
    assert_eq!(synced.value.login, "alice");
    assert_eq!(source.user_calls(), 1);
}

#[tokio::test]
async fn test_stale_record_served_on_error() {
    let Setup {
        sync,
        source,
        storage,
    } = setup();
    storage.upsert_repos("alice", &repos("alice")).await.unwrap();
    source.fail_with(FetchError::RequestFailed("connection reset".into()));

    let synced = sync.sync_repos("alice", &token()).await.unwrap();
    assert_eq!(synced.origin, Origin::Stale);
    assert_eq!(synced.value.len(), 3);
}

#[tokio::test]
async fn test_stale_fallback_disabled() {
    let config = Config {
        serve_stale_on_error: false,
        ..Default::default()
    };
    let Setup { sync, source, .. } = setup_with(config, FakeSource::default());
    sync.caches()
        .users
        .put(aged_user("alice", 31 * DAY))
        .unwrap();
    source.fail_with(FetchError::RequestFailed("connection reset".into()));

    let err = sync.sync_user("alice", &token()).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::FetchFailed(FetchError::RequestFailed(_))
    ));
}

#[tokio::test]
async fn test_not_found_is_not_served_stale() {
    let Setup { sync, .. } = setup();
    sync.caches()
        .users
        .put(aged_user("ghost", 31 * DAY))
        .unwrap();

    let err = sync.sync_user("ghost", &token()).await.unwrap_err();
    assert_eq!(err, SyncError::FetchFailed(FetchError::NotFound));
}

#[tokio::test]
async fn test_persistence_failure_keeps_value() {
    let Setup {
        sync,
        source,
        storage,
    } = setup();
    storage.fail_writes.store(true, Ordering::SeqCst);

    let synced = sync.sync_user("alice", &token()).await.unwrap();
    assert_eq!(synced.origin, Origin::Fetched);
    assert_eq!(synced.value.login, "alice");
    assert_eq!(
        synced.persist_error,
        Some(SyncError::PersistenceFailed("disk full".into()))
    );
    assert!(storage.user_basic("alice").await.unwrap().is_none());

    // The value was cached before the storage write failed.
    let cached = sync.sync_user("alice", &token()).await.unwrap();
    assert_eq!(cached.origin, Origin::Cache);
    assert_eq!(cached.persist_error, None);
    assert_eq!(source.user_calls(), 1);
}

#[tokio::test]
async fn test_sync_repos_caches_tech_stats() {
    let Setup {
        sync,
        source,
        storage,
    } = setup();

    let synced = sync.sync_repos("alice", &token()).await.unwrap();
    assert_eq!(synced.origin, Origin::Fetched);
    assert_eq!(synced.value.len(), 3);

    let stats = sync.tech_stats("alice").await.unwrap();
    assert_eq!(stats.origin, Origin::Cache);
    assert_eq!(stats.value.total_stars, 35);
    assert_eq!(stats.value.primary_language(), Some("Rust"));

    let stored = storage.repos("alice").await.unwrap().unwrap();
    assert_eq!(stored.value, *synced.value);
    assert_eq!(source.repo_calls(), 1);
    assert_eq!(source.user_calls(), 0);
}

#[tokio::test]
async fn test_sync_profile() {
    let Setup { sync, source, .. } = setup();

    let profile = sync.sync_profile("alice", &token()).await.unwrap();
    assert_eq!(profile.origin, Origin::Fetched);
    assert_eq!(profile.value.user.login, "alice");
    assert_eq!(profile.value.repos.len(), 3);
    assert_eq!(profile.value.tech_stats.languages["Rust"].repos, 2);

    let profile = sync.sync_profile("alice", &token()).await.unwrap();
    assert_eq!(profile.origin, Origin::Cache);
    assert_eq!((source.user_calls(), source.repo_calls()), (1, 1));
}

#[tokio::test]
async fn test_resync_bypasses_freshness() {
    let Setup { sync, source, .. } = setup();
    sync.sync_profile("alice", &token()).await.unwrap();

    let profile = sync.resync_profile("alice", &token()).await.unwrap();
    assert_eq!(profile.origin, Origin::Fetched);
    assert_eq!((source.user_calls(), source.repo_calls()), (2, 2));

    source.fail_with(FetchError::RequestFailed("connection reset".into()));
    let err = sync.resync_profile("alice", &token()).await.unwrap_err();
    assert!(matches!(err, SyncError::FetchFailed(_)));
    // Nothing stale is left in the caches after a failed resync.
    assert!(sync.caches().users.get(&CacheKey::user("alice")).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resync_supersedes_fetch_in_flight() {
    let Setup {
        sync,
        source,
        storage,
    } = setup();
    source.delay_next([Duration::from_secs(5)]);
    let token = token();

    let (before, resynced) = futures::join!(sync.sync_user("alice", &token), async {
        sleep(Duration::from_secs(1)).await;
        sync.resync_profile("alice", &token).await
    });

    assert_eq!(before.unwrap().value.followers, 1);
    let resynced = resynced.unwrap();
    assert_eq!(resynced.origin, Origin::Fetched);
    assert_eq!(resynced.value.user.followers, 2);
    assert_eq!(source.user_calls(), 2);
    assert_eq!(sync.pending_count(), 0);

    let cached = sync.user("alice").await.unwrap();
    assert_eq!(cached.value.followers, 2);
    let stored = storage.user_basic("alice").await.unwrap().unwrap();
    assert_eq!(stored.value.followers, 2);
}

#[tokio::test]
async fn test_read_only_not_found() {
    let Setup { sync, source, .. } = setup();

    assert_eq!(sync.user("nobody").await.unwrap_err(), SyncError::NotFound);
    assert_eq!(sync.repos("nobody").await.unwrap_err(), SyncError::NotFound);
    assert_eq!(sync.profile("nobody").await.unwrap_err(), SyncError::NotFound);
    assert_eq!(
        sync.tech_stats("nobody").await.unwrap_err(),
        SyncError::NotFound
    );
    assert_eq!((source.user_calls(), source.repo_calls()), (0, 0));
}

#[tokio::test]
async fn test_read_only_hydrates_caches() {
    let Setup { sync, storage, .. } = setup();
    storage.upsert_user(&user("alice")).await.unwrap();
    storage.upsert_repos("alice", &repos("alice")).await.unwrap();
    let stored = storage.user_full("alice").await.unwrap().unwrap();

    let profile = sync.profile("alice").await.unwrap();
    assert_eq!(profile.origin, Origin::Cache);
    assert_eq!(*profile.value, stored.value);

    let user = sync.caches().users.get(&CacheKey::user("alice")).unwrap();
    assert_eq!(user.unwrap().inserted_at(), stored.synced_at);
    let stats = sync
        .caches()
        .tech_stats
        .get(&CacheKey::tech_stats("alice"))
        .unwrap();
    assert_eq!(**stats.unwrap().value(), stored.value.tech_stats);
}

#[tokio::test]
async fn test_repo_lookup() {
    let Setup { sync, storage, .. } = setup();
    storage.upsert_repos("alice", &repos("alice")).await.unwrap();

    let repo = sync.repo("alice", "Three").await.unwrap();
    assert_eq!(repo.value.full_name, "alice/three");
    assert_eq!(repo.origin, Origin::Cache);

    sync.sync_repos("bob", &token()).await.unwrap();
    let repo = sync.repo("bob", "one").await.unwrap();
    assert_eq!(repo.value.full_name, "bob/one");
    assert_eq!(
        sync.repo("bob", "four").await.unwrap_err(),
        SyncError::NotFound
    );
}

#[tokio::test]
async fn test_cleanup_and_stats() {
    let Setup { sync, .. } = setup();
    sync.caches()
        .users
        .put(aged_user("old", 40 * DAY))
        .unwrap();
    sync.sync_profile("alice", &token()).await.unwrap();

    let stats = sync.stats().unwrap();
    assert_eq!(stats.caches.total.total_entries, 4);
    assert_eq!(stats.caches.caches["users"].total_entries, 2);
    assert_eq!(stats.pending["users"], 0);

    let report = sync.cleanup(30 * DAY).unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.caches["users"], 1);
    assert_eq!(sync.stats().unwrap().caches.total.total_entries, 3);

    let json = serde_json::to_value(sync.stats().unwrap()).unwrap();
    assert_eq!(json["total"]["totalEntries"], 3);
    assert_eq!(json["pending"]["repos"], 0);
}

#[tokio::test]
async fn test_panicking_source() {
    let Setup { sync, .. } = setup();

    let err = sync.sync_user("explode", &token()).await.unwrap_err();
    assert_eq!(err, SyncError::InternalError);
    assert_eq!(sync.pending_count(), 0);
}
