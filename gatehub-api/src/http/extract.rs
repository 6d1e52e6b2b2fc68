//! Request extractors

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use gatehub_core::ErrorCode;

use super::AppError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const SERVICE_GROUP_HEADER: &str = "x-service-group-id";

/// Tenant and service group established by the authentication layer in
/// front of this service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub tenant_id: String,
    pub service_group_id: String,
}

impl<S: Send + Sync> FromRequestParts<S> for TenantScope {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = header(&parts.headers, TENANT_HEADER).ok_or_else(|| {
            AppError::bad_request(
                ErrorCode::MissingTenantId.as_str(),
                "X-Tenant-Id header is required",
            )
        })?;
        let service_group_id = header(&parts.headers, SERVICE_GROUP_HEADER).ok_or_else(|| {
            AppError::bad_request(
                ErrorCode::MissingServiceGroupId.as_str(),
                "X-Service-Group-Id header is required",
            )
        })?;

        Ok(Self {
            tenant_id,
            service_group_id,
        })
    }
}

/// Best-effort peer address: proxy headers first, then the socket
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = header(&parts.headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .or_else(|| header(&parts.headers, "x-real-ip"));

        let addr = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(addr))
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}
