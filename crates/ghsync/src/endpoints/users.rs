use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use ghsync_service::sync::{Origin, Synced};
use ghsync_service::types::{AccessToken, TechStats, UserProfile};
use serde::Serialize;

use crate::service::RequestService;

use super::ResponseError;

/// The header carrying the caller's GitHub access token.
pub const GITHUB_TOKEN_HEADER: &str = "x-github-token";

/// A synchronized value along with where it came from.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedResponse<T> {
    data: Arc<T>,
    origin: Origin,
    #[serde(skip_serializing_if = "Option::is_none")]
    persist_error: Option<String>,
}

impl<T> From<Synced<T>> for SyncedResponse<T> {
    fn from(synced: Synced<T>) -> Self {
        Self {
            data: synced.value,
            origin: synced.origin,
            persist_error: synced.persist_error.map(|err| err.to_string()),
        }
    }
}

type SyncedResult<T> = Result<Json<SyncedResponse<T>>, ResponseError>;

fn github_token(headers: &HeaderMap) -> Result<AccessToken, ResponseError> {
    headers
        .get(GITHUB_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(AccessToken::new)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing `X-GitHub-Token` header").into())
}

fn configure_scope(login: &str) {
    sentry::configure_scope(|scope| scope.set_tag("request.login", login));
}

/// Returns the cached or persisted profile without contacting GitHub.
pub async fn get_profile(
    State(service): State<RequestService>,
    Path(login): Path<String>,
) -> SyncedResult<UserProfile> {
    let profile = service.synchronizer().profile(&login).await?;
    Ok(Json(profile.into()))
}

pub async fn get_tech_stats(
    State(service): State<RequestService>,
    Path(login): Path<String>,
) -> SyncedResult<TechStats> {
    let stats = service.synchronizer().tech_stats(&login).await?;
    Ok(Json(stats.into()))
}

/// Returns the profile, fetching whatever is missing or stale from GitHub.
pub async fn sync_profile(
    State(service): State<RequestService>,
    Path(login): Path<String>,
    headers: HeaderMap,
) -> SyncedResult<UserProfile> {
    configure_scope(&login);
    let token = github_token(&headers)?;
    let profile = service.synchronizer().sync_profile(&login, &token).await?;
    Ok(Json(profile.into()))
}

/// Discards the cached profile and fetches it again.
pub async fn resync_profile(
    State(service): State<RequestService>,
    Path(login): Path<String>,
    headers: HeaderMap,
) -> SyncedResult<UserProfile> {
    configure_scope(&login);
    let token = github_token(&headers)?;
    let profile = service.synchronizer().resync_profile(&login, &token).await?;
    Ok(Json(profile.into()))
}
