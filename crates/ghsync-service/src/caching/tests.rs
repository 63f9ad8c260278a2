use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use crate::config::Config;
use crate::types::{GitHubUser, TechStats};

use super::*;

fn user(login: &str) -> GitHubUser {
    serde_json::from_value(serde_json::json!({"login": login, "id": 1})).unwrap()
}

fn aged(login: &str, days: i64) -> CacheEntry<GitHubUser> {
    CacheEntry::with_inserted_at(
        CacheKey::user(login),
        Arc::new(user(login)),
        Utc::now() - TimeDelta::days(days),
    )
}

fn fs_config(dir: &std::path::Path) -> Config {
    Config {
        cache_dir: Some(dir.to_path_buf()),
        ..Default::default()
    }
}

fn count_files(dir: &std::path::Path) -> usize {
    let mut count = 0;
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            count += count_files(&path);
        } else {
            count += 1;
        }
    }
    count
}

#[test]
fn test_cleanup_old_entries_in_memory() {
    ghsync_test::setup();
    let store = CacheStore::<GitHubUser>::in_memory(CacheName::Users, 100);
    store.put(aged("ten", 10)).unwrap();
    store.put(aged("forty", 40)).unwrap();
    store.put(aged("four-hundred", 400)).unwrap();

    let removed = store
        .cleanup_old_entries(Duration::from_secs(30 * 24 * 3600))
        .unwrap();
    assert_eq!(removed, 2);

    assert!(store.get(&CacheKey::user("ten")).unwrap().is_some());
    assert!(store.get(&CacheKey::user("forty")).unwrap().is_none());
    assert!(store.get(&CacheKey::user("four-hundred")).unwrap().is_none());
    assert_eq!(store.stats().unwrap().total_entries, 1);
}

#[test]
fn test_cleanup_old_entries_fs() {
    ghsync_test::setup();
    let dir = ghsync_test::tempdir();
    let config = fs_config(dir.path());
    let caches = Caches::from_config(&config).unwrap();

    caches.users.put(aged("ten", 10)).unwrap();
    caches.users.put(aged("forty", 40)).unwrap();
    caches.users.put(aged("four-hundred", 400)).unwrap();
    assert_eq!(count_files(&dir.path().join("users")), 3);

    let report = caches
        .cleanup_old_entries(Duration::from_secs(30 * 24 * 3600))
        .unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.caches["users"], 2);
    assert_eq!(report.caches["repos"], 0);

    assert_eq!(count_files(&dir.path().join("users")), 1);
    assert!(caches.users.get(&CacheKey::user("ten")).unwrap().is_some());
    assert!(caches.users.get(&CacheKey::user("forty")).unwrap().is_none());
}

#[test]
fn test_fs_round_trip() {
    ghsync_test::setup();
    let dir = ghsync_test::tempdir();
    let config = fs_config(dir.path());
    let caches = Caches::from_config(&config).unwrap();

    let entry = caches
        .users
        .set(CacheKey::user("Alice"), Arc::new(user("alice")))
        .unwrap();

    let cached = caches.users.get(&CacheKey::user("alice")).unwrap().unwrap();
    assert_eq!(cached.value().login, "alice");
    assert_eq!(cached.inserted_at(), entry.inserted_at());
    assert!(cached.is_fresh(Duration::from_secs(60)));

    // A second instance on the same directory sees the persisted entry.
    let reopened = Caches::from_config(&config).unwrap();
    assert!(reopened.users.get(&CacheKey::user("alice")).unwrap().is_some());
    assert!(reopened.repos.get(&CacheKey::repos("alice")).unwrap().is_none());

    assert!(reopened.users.invalidate(&CacheKey::user("alice")).unwrap());
    assert!(caches.users.get(&CacheKey::user("alice")).unwrap().is_none());
}

#[test]
fn test_fs_malformed_entry() {
    ghsync_test::setup();
    let dir = ghsync_test::tempdir();
    let caches = Caches::from_config(&fs_config(dir.path())).unwrap();

    let key = CacheKey::tech_stats("alice");
    caches.tech_stats.set(key.clone(), Arc::new(TechStats::default())).unwrap();

    let path = dir.path().join("tech_stats").join(key.cache_path());
    fs::write(&path, b"{ not json").unwrap();

    let err = caches.tech_stats.get(&key).unwrap_err();
    assert!(matches!(err, CacheError::Malformed(_)));

    // Cleanup removes the corrupt file without counting it as an entry.
    let removed = caches.tech_stats.cleanup_old_entries(Duration::ZERO).unwrap();
    assert_eq!(removed, 0);
    assert!(!path.exists());
}

#[test]
fn test_clear_tmp() {
    ghsync_test::setup();
    let dir = ghsync_test::tempdir();
    let config = fs_config(dir.path());
    let caches = Caches::from_config(&config).unwrap();

    let leftover = dir.path().join("tmp").join(".tmpXYZ");
    fs::write(&leftover, b"partial").unwrap();

    caches.clear_tmp(&config).unwrap();
    assert!(!leftover.exists());
    assert!(dir.path().join("tmp").is_dir());
}

#[test]
fn test_stats() {
    ghsync_test::setup();
    let caches = Caches::from_config(&Config::default()).unwrap();

    let empty = caches.stats().unwrap();
    assert_eq!(empty.total.total_entries, 0);
    assert_eq!(empty.total.oldest_entry_age, None);

    caches.users.put(aged("alice", 10)).unwrap();
    caches.users.put(aged("bob", 2)).unwrap();
    caches
        .repos
        .put(CacheEntry::with_inserted_at(
            CacheKey::repos("alice"),
            Arc::new(vec![]),
            Utc::now() - TimeDelta::days(1),
        ))
        .unwrap();

    let stats = caches.stats().unwrap();
    assert_eq!(stats.total.total_entries, 3);
    assert_eq!(stats.caches["users"].total_entries, 2);
    assert_eq!(stats.caches["tech_stats"].total_entries, 0);

    let day = Duration::from_secs(24 * 3600);
    let oldest = stats.total.oldest_entry_age.unwrap();
    let newest = stats.total.newest_entry_age.unwrap();
    assert!(oldest >= 10 * day && oldest < 11 * day);
    assert!(newest >= day && newest < 2 * day);

    let json = serde_json::to_value(&stats.caches["users"]).unwrap();
    assert_eq!(json["name"], "users");
    assert_eq!(json["totalEntries"], 2);
    assert!(json["oldestEntryAgeMs"].as_u64().unwrap() >= 10 * 24 * 3600 * 1000);
}

#[test]
fn test_cleanup_without_cache_dir() {
    ghsync_test::setup();
    assert!(cleanup(Config::default(), None).is_err());
}
