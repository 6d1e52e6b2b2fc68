//! Registration and discovery endpoints used by SDK clients
//!
//! All routes are POST with a JSON body; tenant and service group come from
//! the `TenantScope` headers and override anything in the body.

use std::str::FromStr;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use gatehub_core::{
    models::{
        HealthStatus, InstanceRegistration, InstanceStatus, InstanceUpdate, ServiceKey,
        ServiceRegistration,
    },
    Error, ErrorCode,
};
use serde::Deserialize;
use serde_json::json;

use super::extract::TenantScope;
use super::{ApiResponse, AppError, AppResult, AppState};

const INSTANCE_NOT_FOUND: &str = "INSTANCE_NOT_FOUND";
const SERVICE_NOT_FOUND: &str = "SERVICE_NOT_FOUND";

pub fn create_registry_router() -> Router<AppState> {
    Router::new()
        .route("/register/instance", post(register_instance))
        .route("/deregister/instance", post(deregister_instance))
        .route("/update/instance", post(update_instance))
        .route("/discover/instance", post(discover_instance))
        .route("/list/instances", post(list_instances))
        .route("/instance/heartbeat", post(instance_heartbeat))
        .route("/update/instance/status", post(update_instance_status))
        .route("/register/service", post(register_service))
        .route("/deregister/service", post(deregister_service))
        .route("/discover/service", post(discover_service))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    #[serde(default)]
    pub service_instance_id: String,
    #[serde(default)]
    pub operator: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInstanceRequest {
    #[serde(default)]
    pub service_instance_id: String,
    #[serde(flatten)]
    pub update: InstanceUpdate,
}

/// Status arrives as text so an unknown value maps to `INVALID_STATUS`
/// instead of a generic body rejection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    #[serde(default)]
    pub service_instance_id: String,
    #[serde(default)]
    pub instance_status: String,
    #[serde(default)]
    pub health_status: Option<String>,
    #[serde(default)]
    pub weight_value: Option<i32>,
}

async fn register_instance(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<InstanceRegistration>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(mut registration) = payload?;
    registration.tenant_id = scope.tenant_id;
    registration.service_group_id = scope.service_group_id;

    let instance = state
        .cluster
        .registry
        .register_instance(registration)
        .await
        .map_err(|e| AppError::from_core(&e, SERVICE_NOT_FOUND, "REGISTER_INSTANCE_FAILED"))?;
    state.cluster.notifier.instance_changed(&instance).await;

    Ok(ApiResponse::ok("Instance registered", instance))
}

async fn deregister_instance(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<InstanceRef>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    let operator = request.operator.as_deref().unwrap_or("api");

    let removed = state
        .cluster
        .registry
        .deregister_instance(&scope.tenant_id, &request.service_instance_id, operator)
        .await
        .map_err(|e| AppError::from_core(&e, INSTANCE_NOT_FOUND, "DEREGISTER_INSTANCE_FAILED"))?;
    state.cluster.notifier.instance_changed(&removed).await;

    Ok(ApiResponse::ok("Instance deregistered", removed))
}

async fn update_instance(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<UpdateInstanceRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;

    let updated = state
        .cluster
        .registry
        .update_instance(&scope.tenant_id, &request.service_instance_id, request.update)
        .await
        .map_err(|e| AppError::from_core(&e, INSTANCE_NOT_FOUND, "UPDATE_INSTANCE_FAILED"))?;
    state.cluster.notifier.instance_changed(&updated).await;

    Ok(ApiResponse::ok("Instance updated", updated))
}

async fn discover_instance(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<ServiceRef>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;

    let instance = state
        .cluster
        .registry
        .discover_instance(&scope.tenant_id, &scope.service_group_id, &request.service_name)
        .await
        .map_err(|e| AppError::from_core(&e, SERVICE_NOT_FOUND, "DISCOVERY_FAILED"))?;

    Ok(ApiResponse::ok("Instance discovered", instance))
}

async fn list_instances(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<ServiceRef>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;

    let instances = state
        .cluster
        .registry
        .list_instances(&scope.tenant_id, &scope.service_group_id, &request.service_name)
        .await
        .map_err(|e| AppError::from_core(&e, SERVICE_NOT_FOUND, "LIST_INSTANCES_FAILED"))?;

    Ok(ApiResponse::ok(
        format!("{} instances", instances.len()),
        instances,
    ))
}

async fn instance_heartbeat(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<InstanceRef>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;

    let outcome = state
        .cluster
        .registry
        .heartbeat(&scope.tenant_id, &request.service_instance_id)
        .await
        .map_err(|e| AppError::from_core(&e, INSTANCE_NOT_FOUND, "HEARTBEAT_FAILED"))?;
    if outcome.restored {
        state.cluster.notifier.instance_changed(&outcome.instance).await;
    }

    Ok(ApiResponse::ok(
        "Heartbeat accepted",
        json!({
            "serviceInstanceId": outcome.instance.service_instance_id,
            "healthStatus": outcome.instance.health_status,
            "lastHeartbeat": outcome.instance.last_heartbeat,
            "restored": outcome.restored,
        }),
    ))
}

async fn update_instance_status(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    const FAILED: &str = "UPDATE_INSTANCE_STATUS_FAILED";
    let Json(request) = payload?;

    let instance_status = InstanceStatus::from_str(&request.instance_status)
        .map_err(|e| AppError::from_core(&invalid_status(&e), INSTANCE_NOT_FOUND, FAILED))?;
    let health_status = request
        .health_status
        .as_deref()
        .map(HealthStatus::from_str)
        .transpose()
        .map_err(|e| AppError::from_core(&invalid_status(&e), INSTANCE_NOT_FOUND, FAILED))?;

    let updated = state
        .cluster
        .registry
        .update_instance_status(
            &scope.tenant_id,
            &request.service_instance_id,
            instance_status,
            health_status,
            request.weight_value,
        )
        .await
        .map_err(|e| AppError::from_core(&e, INSTANCE_NOT_FOUND, FAILED))?;
    state.cluster.notifier.instance_changed(&updated).await;

    Ok(ApiResponse::ok("Instance status updated", updated))
}

async fn register_service(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<ServiceRegistration>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(mut registration) = payload?;
    registration.tenant_id = scope.tenant_id;
    registration.service_group_id = scope.service_group_id;

    let service = state
        .cluster
        .registry
        .register_service(registration)
        .await
        .map_err(|e| AppError::from_core(&e, SERVICE_NOT_FOUND, "REGISTER_SERVICE_FAILED"))?;

    Ok(ApiResponse::ok("Service registered", service))
}

async fn deregister_service(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<ServiceRef>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    let operator = request.operator.as_deref().unwrap_or("api");

    state
        .cluster
        .registry
        .deregister_service(
            &scope.tenant_id,
            &scope.service_group_id,
            &request.service_name,
            operator,
        )
        .await
        .map_err(|e| AppError::from_core(&e, SERVICE_NOT_FOUND, "DEREGISTER_SERVICE_FAILED"))?;

    let key = ServiceKey::new(&scope.tenant_id, &scope.service_group_id, &request.service_name);
    state.cluster.notifier.notify_service(&key).await;

    Ok(ApiResponse::ok("Service deregistered", json!({ "serviceName": request.service_name })))
}

async fn discover_service(
    State(state): State<AppState>,
    scope: TenantScope,
    payload: Result<Json<ServiceRef>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;

    let service = state
        .cluster
        .registry
        .discover_service(
            &scope.tenant_id,
            &scope.service_group_id,
            request.group_name.as_deref().unwrap_or_default(),
            &request.service_name,
        )
        .await
        .map_err(|e| AppError::from_core(&e, SERVICE_NOT_FOUND, "DISCOVERY_FAILED"))?;

    Ok(ApiResponse::ok("Service discovered", service))
}

fn invalid_status(err: &impl std::fmt::Display) -> Error {
    Error::validation(ErrorCode::InvalidStatus, err.to_string())
}
