// Module: http
// JSON request/response API plus the WebSocket stream endpoint

pub mod error;
pub mod events;
pub mod extract;
pub mod health;
pub mod registry;
pub mod stream;

use axum::{routing::get, Router};
use gatehub_cluster::ClusterContext;
use tower_http::trace::TraceLayer;

pub use error::{ApiResponse, AppError, AppResult};
pub use extract::TenantScope;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cluster: ClusterContext,
    /// Per-connection outbound queue depth
    pub outbound_buffer: usize,
}

impl AppState {
    #[must_use]
    pub fn new(cluster: ClusterContext, outbound_buffer: usize) -> Self {
        Self {
            cluster,
            outbound_buffer,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/registry", registry::create_registry_router())
        .route("/api/v1/stream", get(stream::stream_handler))
        .merge(events::create_events_router())
        .merge(health::create_health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
