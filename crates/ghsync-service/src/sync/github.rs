//! Access to the GitHub REST API.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::GitHubConfig;
use crate::types::{AccessToken, GitHubRepo, GitHubUser};
use crate::utils::http::{FetchTimeouts, create_client};

use super::FetchError;

/// Number of repositories requested per page, the maximum GitHub allows.
const REPOS_PER_PAGE: usize = 100;

const API_VERSION: &str = "2022-11-28";

/// The external source of user profiles and repositories.
pub trait ProfileSource: Send + Sync + 'static {
    fn fetch_user<'a>(
        &'a self,
        token: &'a AccessToken,
        login: &'a str,
    ) -> BoxFuture<'a, Result<GitHubUser, FetchError>>;

    fn fetch_repos<'a>(
        &'a self,
        token: &'a AccessToken,
        login: &'a str,
    ) -> BoxFuture<'a, Result<Vec<GitHubRepo>, FetchError>>;
}

/// The body of GitHub error responses.
#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// A [`ProfileSource`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: Url,
    timeout: Duration,
    max_repo_pages: usize,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> reqwest::Result<Self> {
        let timeouts = FetchTimeouts::from_config(config);
        Ok(Self {
            client: create_client(&timeouts)?,
            api_url: config.api_url.clone(),
            timeout: timeouts.request,
            max_repo_pages: config.max_repo_pages,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::RequestFailed(format!("invalid API URL `{}`", self.api_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        token: &AccessToken,
        url: Url,
    ) -> Result<T, FetchError> {
        let start = Instant::now();
        tracing::debug!(%url, "Fetching from GitHub");

        let result = self.send(token, url).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(FetchError::NotFound) => "not_found",
            Err(FetchError::RateLimited { .. }) => "rate_limited",
            Err(FetchError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        metric!(timer("github.request.duration") = start.elapsed(), "endpoint" => endpoint, "status" => status);

        let bytes = result?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))
    }

    async fn send(&self, token: &AccessToken, url: Url) -> Result<bytes::Bytes, FetchError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token.as_str())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return response.bytes().await.map_err(|e| self.transport_error(e));
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_default();
        let message = serde_json::from_slice::<ErrorBody>(&body)
            .map(|body| body.message)
            .unwrap_or_else(|_| status.to_string());
        Err(status_error(status, &headers, message))
    }

    fn transport_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::RequestFailed(err.to_string())
        }
    }

    async fn get_user(&self, token: &AccessToken, login: &str) -> Result<GitHubUser, FetchError> {
        let url = self.endpoint(&["users", login])?;
        self.get_json("user", token, url).await
    }

    async fn get_repos(
        &self,
        token: &AccessToken,
        login: &str,
    ) -> Result<Vec<GitHubRepo>, FetchError> {
        let mut repos = Vec::new();
        for page in 1..=self.max_repo_pages {
            let mut url = self.endpoint(&["users", login, "repos"])?;
            url.query_pairs_mut()
                .append_pair("per_page", &REPOS_PER_PAGE.to_string())
                .append_pair("page", &page.to_string());

            let batch: Vec<GitHubRepo> = self.get_json("repos", token, url).await?;
            let last_page = batch.len() < REPOS_PER_PAGE;
            repos.extend(batch);
            if last_page {
                return Ok(repos);
            }
        }

        tracing::debug!(
            login,
            "Stopped fetching repositories after {} pages",
            self.max_repo_pages
        );
        Ok(repos)
    }
}

impl ProfileSource for GitHubClient {
    fn fetch_user<'a>(
        &'a self,
        token: &'a AccessToken,
        login: &'a str,
    ) -> BoxFuture<'a, Result<GitHubUser, FetchError>> {
        self.get_user(token, login).boxed()
    }

    fn fetch_repos<'a>(
        &'a self,
        token: &'a AccessToken,
        login: &'a str,
    ) -> BoxFuture<'a, Result<Vec<GitHubRepo>, FetchError>> {
        self.get_repos(token, login).boxed()
    }
}

/// Maps an unsuccessful response to a [`FetchError`].
fn status_error(status: StatusCode, headers: &HeaderMap, message: String) -> FetchError {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    };
    let exhausted = header("x-ratelimit-remaining") == Some("0");
    let reset_at = header("x-ratelimit-reset")
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound,
        StatusCode::UNAUTHORIZED => FetchError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { reset_at },
        StatusCode::FORBIDDEN if exhausted => FetchError::RateLimited { reset_at },
        StatusCode::FORBIDDEN => FetchError::PermissionDenied(message),
        _ => FetchError::RequestFailed(format!("{status}: {message}")),
    }
}
