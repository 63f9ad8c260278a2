use std::time::Duration;

use crate::config::GitHubConfig;

/// The `User-Agent` sent with every outgoing request. GitHub rejects requests without one.
pub const USER_AGENT: &str = concat!("ghsync/", env!("CARGO_PKG_VERSION"));

/// Timeouts applied to requests against the external profile source.
#[derive(Copy, Clone, Debug)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one request, including reading the body.
    pub request: Duration,
}

impl FetchTimeouts {
    pub fn from_config(config: &GitHubConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            request: config.timeout,
        }
    }
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            request: Duration::from_secs(30),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
pub fn create_client(timeouts: &FetchTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
