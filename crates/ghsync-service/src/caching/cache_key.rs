use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::CacheName;

/// Identifies one cached entity: the kind of entity and its identifier.
///
/// Identifiers are case-insensitive, `Alice` and `alice` map to the same key. Two keys compare
/// equal when their hashes are equal.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    name: CacheName,
    id: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    pub fn new(name: CacheName, id: &str) -> Self {
        let id = id.trim().to_lowercase();
        let hash = Sha256::digest(format!("{name}:{id}"));
        let hash = <[u8; 32]>::from(hash);

        Self {
            name,
            id: id.into(),
            hash,
        }
    }

    /// The key of a user profile.
    pub fn user(login: &str) -> Self {
        Self::new(CacheName::Users, login)
    }

    /// The key of the repository list of a user.
    pub fn repos(login: &str) -> Self {
        Self::new(CacheName::Repos, login)
    }

    /// The key of the tech stats of a user.
    pub fn tech_stats(login: &str) -> Self {
        Self::new(CacheName::TechStats, login)
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Returns the normalized identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the relative path of this key inside its cache directory.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so: `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}
