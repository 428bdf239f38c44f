//! HTTP front end for the upload engine.

pub mod error;
pub mod routes;

use axum::http::{
    Method,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::AppState;

/// Build the router. Chunk bodies above the engine's `max_chunk_bytes` are
/// refused before they are buffered.
pub fn app(state: AppState) -> Router {
    let body_limit = state.service.config().max_chunk_bytes;

    // Permissive: upload clients connect from various origins
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, CONTENT_LENGTH])
        .allow_credentials(false);

    Router::new()
        .route("/sessions", post(routes::start_session).get(routes::list_sessions))
        .route(
            "/sessions/{id}",
            get(routes::get_status).delete(routes::cancel),
        )
        .route("/sessions/{id}/resume", post(routes::resume_session))
        .route("/sessions/{id}/chunks/{index}", put(routes::upload_chunk))
        .route("/sessions/{id}/complete", post(routes::complete))
        .route("/health", get(routes::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
