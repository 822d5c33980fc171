pub mod routes;

use crate::state::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health and metrics endpoints
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/metrics", get(routes::metrics))
        // Video analysis
        .route(
            "/v1/analyses",
            get(routes::list_analyses).post(routes::submit_analysis),
        )
        .route(
            "/v1/analyses/:id",
            get(routes::get_analysis).delete(routes::cancel_analysis),
        )
        // Live frames
        .route("/v1/live/match", post(routes::live_match))
        // Gallery
        .route(
            "/v1/gallery",
            get(routes::list_gallery).post(routes::enroll_identity),
        )
        .route("/v1/gallery/:id", delete(routes::remove_identity))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
