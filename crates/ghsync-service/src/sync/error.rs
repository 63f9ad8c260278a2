use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::caching::CacheError;

/// An error fetching data from the external profile source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The requested user does not exist.
    #[error("not found")]
    NotFound,
    /// The access token was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The access token is valid but lacks access to the resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The rate limit of the token is exhausted.
    #[error("rate limited")]
    RateLimited {
        /// When the rate limit resets, if the source reported it.
        reset_at: Option<DateTime<Utc>>,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    RequestFailed(String),
    /// The source responded with a payload that could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// An error of the permanent profile storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

/// An error of a synchronization operation.
///
/// Errors are cloneable so that a single failed fetch can be handed to all coalesced callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Nothing is cached or persisted, and no fetch was requested.
    #[error("not found")]
    NotFound,
    /// Fetching from the external source failed.
    #[error("fetching from GitHub failed")]
    FetchFailed(#[from] FetchError),
    /// Writing to permanent storage failed.
    #[error("persisting failed: {0}")]
    PersistenceFailed(String),
    /// The cache could not be read or written.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
    /// An unexpected failure, for example a panicking operation.
    #[error("internal error")]
    InternalError,
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        Self::PersistenceFailed(err.0)
    }
}

impl From<CacheError> for SyncError {
    fn from(err: CacheError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
