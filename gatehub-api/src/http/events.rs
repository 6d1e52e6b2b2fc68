//! Cluster event publishing for the admin controllers

use std::str::FromStr;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use gatehub_core::models::{ClusterEvent, EventAction, EventType};
use serde::Deserialize;
use serde_json::json;

use super::extract::TenantScope;
use super::{ApiResponse, AppError, AppResult, AppState};

pub fn create_events_router() -> Router<AppState> {
    Router::new().route("/api/v1/cluster/events", post(publish_event))
}

/// Tags arrive as text so unknown values get their own error codes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventRequest {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_action: String,
    #[serde(default)]
    pub event_payload: Option<serde_json::Value>,
    /// Defaults to the bus's configured expiry when absent
    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
}

async fn publish_event(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<PublishEventRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    let event_type = EventType::from_str(request.event_type.trim())
        .map_err(|e| AppError::bad_request("INVALID_EVENT_TYPE", e.to_string()))?;
    let event_action = EventAction::from_str(request.event_action.trim())
        .map_err(|e| AppError::bad_request("INVALID_EVENT_ACTION", e.to_string()))?;

    if !state.cluster.event_bus.is_ready() {
        return Err(AppError::service_unavailable(
            "EVENT_BUS_NOT_READY",
            "Cluster event bus is not ready",
        ));
    }

    let mut event = ClusterEvent::new(
        scope.tenant_id,
        event_type,
        event_action,
        request.event_payload.unwrap_or_else(|| json!({})),
    );
    if let Some(expire_time) = request.expire_time {
        event = event.with_expire_time(expire_time);
    }

    let event_id = state.cluster.publisher.publish(event).await.ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "PUBLISH_EVENT_FAILED",
            "Failed to publish cluster event",
        )
    })?;

    Ok(ApiResponse::ok(
        "Event published",
        json!({
            "eventId": event_id,
            "eventType": event_type,
            "eventAction": event_action,
        }),
    ))
}
