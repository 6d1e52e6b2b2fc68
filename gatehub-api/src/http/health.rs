//! Health check endpoints
//!
//! Provides simple health check for monitoring probes.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/cluster/status", get(cluster_status))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Node identity, event bus readiness and connection counters
pub async fn cluster_status(State(state): State<AppState>) -> impl IntoResponse {
    let bus = &state.cluster.event_bus;
    Json(json!({
        "nodeId": bus.node_id(),
        "nodeIp": bus.node_ip(),
        "eventBusReady": bus.is_ready(),
        "connections": state.cluster.connections.metrics(),
    }))
}
