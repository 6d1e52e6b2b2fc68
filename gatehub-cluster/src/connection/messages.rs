//! JSON wire protocol for the bidirectional stream

use chrono::{DateTime, Utc};
use gatehub_core::models::{EventAction, EventType, InstanceRegistration, ServiceInstance};
use serde::{Deserialize, Serialize};

/// `SERVER_CLOSE` reason sent to connections evicted for missed pings
pub const CLOSE_REASON_CLIENT_TIMEOUT: &str = "client_timeout";
/// `SERVER_CLOSE` reason sent to every connection on shutdown
pub const CLOSE_REASON_SERVER_SHUTDOWN: &str = "server_shutdown";

/// Messages sent by nodes and SDK clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Client metadata, sent once after the stream opens
    Hello {
        #[serde(default)]
        request_id: Option<String>,
        client_id: String,
        #[serde(default)]
        tenant_id: Option<String>,
        #[serde(default)]
        namespace_id: Option<String>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },
    RegisterInstance {
        #[serde(default)]
        request_id: Option<String>,
        instance: InstanceRegistration,
    },
    DeregisterInstance {
        #[serde(default)]
        request_id: Option<String>,
        service_instance_id: String,
    },
    /// An empty `service_names` subscribes to the whole group
    SubscribeService {
        #[serde(default)]
        request_id: Option<String>,
        namespace_id: String,
        group_name: String,
        #[serde(default)]
        service_names: Vec<String>,
    },
    WatchConfig {
        #[serde(default)]
        request_id: Option<String>,
        namespace_id: String,
        group_name: String,
        config_data_ids: Vec<String>,
    },
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl ClientMessage {
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Hello { request_id, .. }
            | Self::RegisterInstance { request_id, .. }
            | Self::DeregisterInstance { request_id, .. }
            | Self::SubscribeService { request_id, .. }
            | Self::WatchConfig { request_id, .. }
            | Self::Ping { request_id } => request_id.as_deref(),
        }
    }
}

/// Messages pushed to connected clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Connected {
        connection_id: String,
        server_time: DateTime<Utc>,
    },
    Pong {
        request_id: Option<String>,
        server_time: DateTime<Utc>,
    },
    /// Reply to a request-carrying client message
    Result {
        request_id: Option<String>,
        success: bool,
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<serde_json::Value>,
    },
    /// Current eligible instances of a service after a change
    ServiceChanged {
        namespace_id: String,
        group_name: String,
        service_name: String,
        instances: Vec<ServiceInstance>,
    },
    ConfigChanged {
        namespace_id: String,
        group_name: String,
        config_data_id: String,
        action: EventAction,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        content: Option<serde_json::Value>,
    },
    /// Lifecycle command for a gateway instance owned by this connection
    GatewayCommand {
        event_id: String,
        instance_id: String,
        action: EventAction,
        payload: serde_json::Value,
    },
    ClusterNotice {
        event_id: String,
        event_type: EventType,
        action: EventAction,
        payload: serde_json::Value,
    },
    ServerClose {
        reason: String,
        message: String,
        /// Milliseconds the client has before the server drops the stream
        grace_period: u64,
    },
}

impl ServerMessage {
    pub fn ok(request_id: Option<String>, message: impl Into<String>) -> Self {
        Self::Result {
            request_id,
            success: true,
            code: "SUCCESS".to_string(),
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(
        request_id: Option<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Result {
            request_id,
            success: false,
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(self, value: serde_json::Value) -> Self {
        match self {
            Self::Result {
                request_id,
                success,
                code,
                message,
                ..
            } => Self::Result {
                request_id,
                success,
                code,
                message,
                data: Some(value),
            },
            other => other,
        }
    }

    pub fn server_close(reason: &str, message: impl Into<String>, grace_period_ms: u64) -> Self {
        Self::ServerClose {
            reason: reason.to_string(),
            message: message.into(),
            grace_period: grace_period_ms,
        }
    }

    /// Wire tag, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "CONNECTED",
            Self::Pong { .. } => "PONG",
            Self::Result { .. } => "RESULT",
            Self::ServiceChanged { .. } => "SERVICE_CHANGED",
            Self::ConfigChanged { .. } => "CONFIG_CHANGED",
            Self::GatewayCommand { .. } => "GATEWAY_COMMAND",
            Self::ClusterNotice { .. } => "CLUSTER_NOTICE",
            Self::ServerClose { .. } => "SERVER_CLOSE",
        }
    }
}
