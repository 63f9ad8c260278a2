use thiserror::Error;

/// An error of a cache backend.
///
/// Cache errors are never fatal to a read: the caller treats the cache as absent and falls
/// through to the authoritative source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backing mechanism could not be reached, for example because of a file system error.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// A persisted entry exists but could not be decoded.
    #[error("malformed cache entry: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// The result of a cache operation.
pub type CacheContents<T = ()> = Result<T, CacheError>;
