//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let max_chunk_size = usize::try_from(state.config.server.max_chunk_size).unwrap_or(usize::MAX);

    let upload_routes = Router::new()
        .route("/v1/uploads", post(handlers::init_upload))
        .route(
            "/v1/uploads/{owner_id}/{content_digest}",
            get(handlers::get_upload_status),
        )
        .route(
            "/v1/uploads/{owner_id}/{content_digest}/chunks/{index}",
            put(handlers::upload_chunk),
        )
        .route(
            "/v1/uploads/{owner_id}/{content_digest}/merge",
            post(handlers::merge_upload),
        )
        .route(
            "/v1/records/{owner_id}/{content_digest}",
            get(handlers::get_upload_record),
        )
        .route("/v1/health", get(handlers::health_check))
        .layer(DefaultBodyLimit::max(max_chunk_size));

    let mut router = upload_routes;

    // When enabled, this endpoint must be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
