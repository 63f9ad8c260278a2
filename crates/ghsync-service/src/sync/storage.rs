//! Permanent storage of synchronized profiles.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};

use crate::types::{GitHubRepo, GitHubUser, Stored, TechStats, UserProfile};

use super::StorageError;

type StorageResult<T> = Result<T, StorageError>;

/// The permanent store of synchronized data.
///
/// Reads return the stored value along with the time it was last synchronized. Logins are
/// case-insensitive.
pub trait ProfileStorage: Send + Sync + 'static {
    /// The user record without repositories.
    fn user_basic<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<GitHubUser>>>>;

    /// The full projection of a user, available once both the user and the repositories were
    /// stored.
    fn user_full<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<UserProfile>>>>;

    fn repos<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<Vec<GitHubRepo>>>>>;

    fn repo<'a>(
        &'a self,
        login: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<GitHubRepo>>>>;

    fn tech_stats<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<TechStats>>>>;

    fn upsert_user<'a>(&'a self, user: &'a GitHubUser) -> BoxFuture<'a, StorageResult<()>>;

    fn upsert_repos<'a>(
        &'a self,
        login: &'a str,
        repos: &'a [GitHubRepo],
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Invalidates derived projections of a user, forcing them to be rebuilt on the next read.
    fn invalidate_user<'a>(&'a self, login: &'a str) -> BoxFuture<'a, StorageResult<()>>;
}

#[derive(Debug, Default)]
struct UserRecord {
    user: Option<Stored<GitHubUser>>,
    repos: Option<Stored<Vec<GitHubRepo>>>,
    /// Materialized from `user` and `repos` on first read.
    profile: Option<Stored<UserProfile>>,
}

impl UserRecord {
    fn profile(&mut self) -> Option<Stored<UserProfile>> {
        if self.profile.is_none() {
            let (user, repos) = (self.user.as_ref()?, self.repos.as_ref()?);
            self.profile = Some(Stored {
                value: UserProfile {
                    user: user.value.clone(),
                    repos: repos.value.clone(),
                    tech_stats: TechStats::from_repos(&repos.value),
                },
                synced_at: user.synced_at.min(repos.synced_at),
            });
        }
        self.profile.clone()
    }
}

/// A [`ProfileStorage`] held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    users: Mutex<HashMap<String, UserRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn users(&self) -> MutexGuard<'_, HashMap<String, UserRecord>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, login: &str, f: impl FnOnce(&mut UserRecord) -> Option<T>) -> Option<T> {
        self.users().get_mut(&normalize(login)).and_then(f)
    }

    fn write(&self, login: &str, f: impl FnOnce(&mut UserRecord, DateTime<Utc>)) {
        let mut users = self.users();
        let record = users.entry(normalize(login)).or_default();
        record.profile = None;
        f(record, Utc::now());
    }
}

fn normalize(login: &str) -> String {
    login.trim().to_lowercase()
}

impl ProfileStorage for MemoryStorage {
    fn user_basic<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<GitHubUser>>>> {
        future::ok(self.read(login, |record| record.user.clone())).boxed()
    }

    fn user_full<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<UserProfile>>>> {
        future::ok(self.read(login, UserRecord::profile)).boxed()
    }

    fn repos<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<Vec<GitHubRepo>>>>> {
        future::ok(self.read(login, |record| record.repos.clone())).boxed()
    }

    fn repo<'a>(
        &'a self,
        login: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<GitHubRepo>>>> {
        let repo = self.read(login, |record| {
            let repos = record.repos.as_ref()?;
            let repo = repos
                .value
                .iter()
                .find(|repo| repo.name.eq_ignore_ascii_case(name))?;
            Some(Stored {
                value: repo.clone(),
                synced_at: repos.synced_at,
            })
        });
        future::ok(repo).boxed()
    }

    fn tech_stats<'a>(
        &'a self,
        login: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<Stored<TechStats>>>> {
        let stats = self.read(login, |record| {
            let repos = record.repos.as_ref()?;
            Some(Stored {
                value: TechStats::from_repos(&repos.value),
                synced_at: repos.synced_at,
            })
        });
        future::ok(stats).boxed()
    }

    fn upsert_user<'a>(&'a self, user: &'a GitHubUser) -> BoxFuture<'a, StorageResult<()>> {
        self.write(&user.login, |record, now| {
            record.user = Some(Stored {
                value: user.clone(),
                synced_at: now,
            });
        });
        future::ok(()).boxed()
    }

    fn upsert_repos<'a>(
        &'a self,
        login: &'a str,
        repos: &'a [GitHubRepo],
    ) -> BoxFuture<'a, StorageResult<()>> {
        self.write(login, |record, now| {
            record.repos = Some(Stored {
                value: repos.to_vec(),
                synced_at: now,
            });
        });
        future::ok(()).boxed()
    }

    fn invalidate_user<'a>(&'a self, login: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        if let Some(record) = self.users().get_mut(&normalize(login)) {
            record.profile = None;
        }
        future::ok(()).boxed()
    }
}
