use std::fmt;

/// All known cache names.
///
/// Each name corresponds to one declared entity kind and is used as the key prefix, the cache
/// directory name and the `cache` metrics tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheName {
    Users,
    Repos,
    TechStats,
}

impl CacheName {
    pub const ALL: [CacheName; 3] = [Self::Users, Self::Repos, Self::TechStats];
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Users => "users",
            Self::Repos => "repos",
            Self::TechStats => "tech_stats",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
