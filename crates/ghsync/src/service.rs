use std::sync::Arc;

use anyhow::{Context, Result};
use ghsync_service::caching::Caches;
use ghsync_service::config::Config;
use ghsync_service::sync::{
    GitHubClient, MemoryStorage, ProfileSource, ProfileStorage, Synchronizer,
};

/// Shared state of all request handlers.
#[derive(Clone, Debug)]
pub struct RequestService {
    inner: Arc<RequestServiceInner>,
}

#[derive(Debug)]
struct RequestServiceInner {
    sync: Synchronizer,
    admin_token: Option<String>,
}

impl RequestService {
    /// Creates the service backed by the GitHub API and in-process storage.
    pub fn create(config: &Config) -> Result<Self> {
        let client = GitHubClient::new(&config.github).context("failed to create GitHub client")?;
        Self::with_parts(config, Arc::new(client), Arc::new(MemoryStorage::new()))
    }

    pub fn with_parts(
        config: &Config,
        source: Arc<dyn ProfileSource>,
        storage: Arc<dyn ProfileStorage>,
    ) -> Result<Self> {
        let caches = Caches::from_config(config).context("failed to open caches")?;
        caches
            .clear_tmp(config)
            .context("failed to clear tmp cache directory")?;

        let inner = RequestServiceInner {
            sync: Synchronizer::new(config, caches, source, storage),
            admin_token: config.admin_token.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.inner.sync
    }

    /// The token required by administrative endpoints, if they are enabled.
    pub fn admin_token(&self) -> Option<&str> {
        self.inner.admin_token.as_deref()
    }
}
