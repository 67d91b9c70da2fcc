//! HTTP surface of the claims sync service.
//!
//! Mounts all endpoint groups under /v1/:
//! - /v1/status     health check
//! - /v1/cron       scheduler trigger (bearer CRON_SECRET)
//! - /v1/oauth      marketplace connect flow
//! - /v1/tenants    connection status and mirrored claim reads (x-internal-secret)

pub mod routes;

use crate::SharedState;
use axum::http::{header, HeaderName, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-internal-secret"),
        ]);

    Router::new()
        .nest("/v1", routes::v1_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
