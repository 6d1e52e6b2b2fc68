//! Built-in handlers bridging cluster events to local connections

use std::sync::Arc;

use async_trait::async_trait;
use gatehub_core::models::{ClusterEvent, EventType};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::handler::{EventHandler, HandleResult};
use crate::connection::{ConnectionManager, PushNotifier, ServerMessage};

/// Payload of a `CONFIG_SYNC` event
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSyncPayload {
    pub namespace_id: String,
    pub group_name: String,
    pub config_data_id: String,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

/// Payload of a `GATEWAY_INSTANCE` event
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInstancePayload {
    pub instance_id: String,
}

/// Pushes `CONFIG_CHANGED` to local connections watching the config key
pub struct ConfigSyncHandler {
    notifier: Arc<PushNotifier>,
}

impl ConfigSyncHandler {
    #[must_use]
    pub const fn new(notifier: Arc<PushNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl EventHandler for ConfigSyncHandler {
    fn event_type(&self) -> EventType {
        EventType::ConfigSync
    }

    fn name(&self) -> &'static str {
        "config_sync"
    }

    async fn handle(&self, event: &ClusterEvent) -> HandleResult {
        let payload: ConfigSyncPayload = match serde_json::from_value(event.event_payload.clone())
        {
            Ok(payload) => payload,
            Err(e) => return HandleResult::failed("invalid config sync payload", e),
        };

        let delivered = self
            .notifier
            .config_changed(
                &event.tenant_id,
                &payload.namespace_id,
                &payload.group_name,
                &payload.config_data_id,
                event.event_action,
                payload.content,
            )
            .await;

        HandleResult::success(format!("config change pushed to {delivered} connections"))
            .with_data(json!({ "delivered": delivered }))
    }
}

/// Forwards lifecycle commands to the connections that registered the
/// target gateway instance
pub struct GatewayInstanceHandler {
    manager: ConnectionManager,
}

impl GatewayInstanceHandler {
    #[must_use]
    pub const fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for GatewayInstanceHandler {
    fn event_type(&self) -> EventType {
        EventType::GatewayInstance
    }

    fn name(&self) -> &'static str {
        "gateway_instance"
    }

    async fn handle(&self, event: &ClusterEvent) -> HandleResult {
        let payload: GatewayInstancePayload =
            match serde_json::from_value(event.event_payload.clone()) {
                Ok(payload) => payload,
                Err(e) => return HandleResult::failed("invalid gateway instance payload", e),
            };

        let owners: Vec<_> = self
            .manager
            .get_all_connections()
            .into_iter()
            .filter(|c| c.owns_node(&payload.instance_id))
            .collect();
        if owners.is_empty() {
            debug!(instance_id = %payload.instance_id, "Gateway instance not connected here");
            return HandleResult::skipped(format!(
                "instance {} has no connection on this node",
                payload.instance_id
            ));
        }

        let command = ServerMessage::GatewayCommand {
            event_id: event.event_id.clone(),
            instance_id: payload.instance_id.clone(),
            action: event.event_action,
            payload: event.event_payload.clone(),
        };

        let mut failures = Vec::new();
        for connection in &owners {
            if let Err(e) = self.manager.send_to(connection, command.clone()).await {
                failures.push(format!("{}: {e}", connection.id()));
            }
        }

        if failures.is_empty() {
            HandleResult::success(format!(
                "{} sent to instance {}",
                event.event_action, payload.instance_id
            ))
        } else {
            HandleResult::retry(format!("command delivery failed: {}", failures.join(", ")))
        }
    }
}

/// Broadcasts alert channel changes as `CLUSTER_NOTICE`
pub struct AlertConfigHandler {
    manager: ConnectionManager,
}

impl AlertConfigHandler {
    #[must_use]
    pub const fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for AlertConfigHandler {
    fn event_type(&self) -> EventType {
        EventType::AlertConfig
    }

    fn name(&self) -> &'static str {
        "alert_config"
    }

    async fn handle(&self, event: &ClusterEvent) -> HandleResult {
        let notice = ServerMessage::ClusterNotice {
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            action: event.event_action,
            payload: event.event_payload.clone(),
        };
        let delivered = self.manager.broadcast_to_all(&notice).await;
        HandleResult::success(format!("alert notice sent to {delivered} connections"))
    }
}
