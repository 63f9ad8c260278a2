use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ghsync_service::sync::{FetchError, SyncError};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl ResponseError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<SyncError> for ResponseError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::NotFound | SyncError::FetchFailed(FetchError::NotFound) => {
                StatusCode::NOT_FOUND
            }
            SyncError::FetchFailed(FetchError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            SyncError::FetchFailed(FetchError::RateLimited { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            SyncError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            SyncError::PersistenceFailed(_)
            | SyncError::StoreUnavailable(_)
            | SyncError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<JoinError> for ResponseError {
    fn from(err: JoinError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((status, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status,
            err: anyhow::anyhow!(msg),
        }
    }
}

impl From<(StatusCode, anyhow::Error)> for ResponseError {
    fn from((status, err): (StatusCode, anyhow::Error)) -> Self {
        Self { status, err }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = (!causes.is_empty()).then_some(causes);

        ApiErrorResponse { detail, causes }
    }
}
