//! Entity types synchronized from GitHub.
//!
//! These mirror the subset of the GitHub REST API payloads the matching application consumes.
//! Unknown fields in API responses are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A GitHub access token supplied by the caller of a sync operation.
///
/// The token is never printed in debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(Arc<str>);

impl AccessToken {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(token.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// A GitHub user profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubUser {
    pub login: String,
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub blog: Option<String>,
    #[serde(default)]
    pub public_repos: u32,
    #[serde(default)]
    pub followers: u32,
    #[serde(default)]
    pub following: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A repository owned by a GitHub user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubRepo {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub stargazers_count: u32,
    #[serde(default)]
    pub forks_count: u32,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Usage of a single language across a user's repositories.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageStats {
    /// Number of repositories whose primary language this is.
    pub repos: u32,
    /// Sum of stars of those repositories.
    pub stars: u32,
}

/// Aggregated technology statistics of a user, derived from their repositories.
///
/// Forked repositories are not counted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechStats {
    pub repo_count: u32,
    pub total_stars: u32,
    pub total_forks: u32,
    pub languages: BTreeMap<String, LanguageStats>,
    pub topics: BTreeMap<String, u32>,
}

impl TechStats {
    pub fn from_repos(repos: &[GitHubRepo]) -> Self {
        let mut stats = TechStats::default();
        for repo in repos.iter().filter(|repo| !repo.fork) {
            stats.repo_count += 1;
            stats.total_stars += repo.stargazers_count;
            stats.total_forks += repo.forks_count;

            if let Some(language) = &repo.language {
                let entry = stats.languages.entry(language.clone()).or_default();
                entry.repos += 1;
                entry.stars += repo.stargazers_count;
            }
            for topic in &repo.topics {
                *stats.topics.entry(topic.to_lowercase()).or_default() += 1;
            }
        }
        stats
    }

    /// Returns the language used by the most repositories, ties broken by stars.
    pub fn primary_language(&self) -> Option<&str> {
        self.languages
            .iter()
            .max_by_key(|(_, lang)| (lang.repos, lang.stars))
            .map(|(name, _)| name.as_str())
    }
}

/// The full projection of a user: profile, repositories and derived statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user: GitHubUser,
    pub repos: Vec<GitHubRepo>,
    pub tech_stats: TechStats,
}

/// A value read from permanent storage, along with the time it was last synchronized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stored<T> {
    pub value: T,
    pub synced_at: DateTime<Utc>,
}
