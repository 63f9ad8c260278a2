use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use ghsync_service::caching::CleanupReport;
use ghsync_service::sync::SyncStats;
use serde::Deserialize;

use crate::service::RequestService;

use super::ResponseError;

const DAY: Duration = Duration::from_secs(24 * 3600);

/// Query parameters of the cache cleanup request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupParams {
    older_than: Option<String>,
}

impl CleanupParams {
    /// The maximum age of kept entries, `olderThan` days between 1 and 365.
    fn max_age(&self) -> Result<Duration, ResponseError> {
        let days = self
            .older_than
            .as_deref()
            .ok_or((StatusCode::BAD_REQUEST, "missing `olderThan` parameter"))?
            .parse::<u32>()
            .ok()
            .filter(|days| (1..=365).contains(days))
            .ok_or((
                StatusCode::BAD_REQUEST,
                "`olderThan` must be a number of days between 1 and 365",
            ))?;
        Ok(DAY * days)
    }
}

pub async fn cleanup_caches(
    State(service): State<RequestService>,
    Query(params): Query<CleanupParams>,
) -> Result<Json<CleanupReport>, ResponseError> {
    let max_age = params.max_age()?;
    tracing::info!(max_age = ?max_age, "Cleaning up caches");

    let report =
        tokio::task::spawn_blocking(move || service.synchronizer().cleanup(max_age)).await??;
    Ok(Json(report))
}

pub async fn cache_stats(
    State(service): State<RequestService>,
) -> Result<Json<SyncStats>, ResponseError> {
    let stats = tokio::task::spawn_blocking(move || service.synchronizer().stats()).await??;
    Ok(Json(stats))
}
