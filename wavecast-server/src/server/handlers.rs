use axum::{Json, extract::State};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::config::CapacityEstimate;
use crate::core::ChatManager;
use crate::monitoring::MemoryStats;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ChatManager>,
}

/// Stats endpoint response.
#[derive(Debug, Serialize)]
pub struct ChatStatsResponse {
    pub total_rooms: usize,
    pub total_users: usize,
    pub total_messages: usize,
    pub memory: MemoryStats,
    pub config: CapacityEstimate,
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "wavecast",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Chat service snapshot.
/// GET /api/chat/stats
pub async fn chat_stats(State(state): State<AppState>) -> Json<ChatStatsResponse> {
    let (total_rooms, total_users, total_messages) = state.manager.directory_totals();
    Json(ChatStatsResponse {
        total_rooms,
        total_users,
        total_messages,
        memory: state.manager.tracker().stats(),
        config: state.manager.config().capacity(),
    })
}
