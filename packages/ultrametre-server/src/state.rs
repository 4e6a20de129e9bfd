use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use ultrametre_core::Bridge;

use crate::{handlers, sse};

/// Shared state for every route
pub struct AppState {
    pub bridge: Arc<Bridge>,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }
}

/// Build the `/bridge/*` API routes.
/// Returns a Router that needs `.fallback_service(...)` and `.with_state(state)`.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bridge/status", get(handlers::status_handler))
        .route("/bridge/start", post(handlers::start_handler))
        .route("/bridge/stop", post(handlers::stop_handler))
        .route("/bridge/fetch-data", post(handlers::fetch_data_handler))
        .route("/bridge/clear", post(handlers::clear_handler))
        .route("/bridge/trigger", post(handlers::trigger_handler))
        .route("/bridge/events", get(sse::events_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
