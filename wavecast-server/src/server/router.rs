use axum::{Router, routing::get};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{self, AppState};
use super::session;

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/chat", get(session::chat_websocket))
        .route("/api/chat/stats", get(handlers::chat_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
