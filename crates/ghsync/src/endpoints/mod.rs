use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};
use ghsync_service::metric;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::RequestService;

mod auth;
mod cache;
mod error;
mod metrics;
mod users;

pub use error::ResponseError;
use metrics::MetricsLayer;

use auth::require_admin;
use cache::{cache_stats, cleanup_caches};
use users::{get_profile, get_tech_stats, resync_profile, sync_profile};

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: RequestService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);

    let admin = Router::new()
        .route("/cache", delete(cleanup_caches))
        .route("/cache/stats", get(cache_stats))
        .route_layer(middleware::from_fn_with_state(
            service.clone(),
            require_admin,
        ));

    Router::new()
        .route("/users/:login", get(get_profile))
        .route("/users/:login/tech-stats", get(get_tech_stats))
        .route("/users/:login/sync", post(sync_profile))
        .route("/users/:login/resync", post(resync_profile))
        .merge(admin)
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
