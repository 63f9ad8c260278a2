use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::service::RequestService;

use super::ResponseError;

/// Rejects requests without the configured admin bearer token.
///
/// Without a configured token, administrative endpoints are disabled entirely.
pub async fn require_admin(
    State(service): State<RequestService>,
    request: Request,
    next: Next,
) -> Result<Response, ResponseError> {
    let Some(expected) = service.admin_token() else {
        return Err((StatusCode::FORBIDDEN, "administrative endpoints are disabled").into());
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(token) if token_matches(token, expected) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!("Rejected request with invalid admin token");
            Err((StatusCode::UNAUTHORIZED, "invalid admin token").into())
        }
        None => Err((StatusCode::UNAUTHORIZED, "missing admin token").into()),
    }
}

/// Compares digests of the tokens, so the time taken does not depend on their common prefix.
fn token_matches(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}
