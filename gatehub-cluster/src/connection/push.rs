use std::sync::Arc;

use gatehub_core::models::{EventAction, ServiceInstance, ServiceKey};
use tracing::{debug, warn};

use super::manager::ConnectionManager;
use super::messages::ServerMessage;
use super::stream_connection::StreamConnection;
use crate::registry::InstanceRegistry;

/// Turns registry and config changes into targeted pushes.
///
/// A subscription's namespace is the instance's service group id; its group
/// is the service's group name.
pub struct PushNotifier {
    manager: ConnectionManager,
    registry: Arc<InstanceRegistry>,
}

impl PushNotifier {
    #[must_use]
    pub const fn new(manager: ConnectionManager, registry: Arc<InstanceRegistry>) -> Self {
        Self { manager, registry }
    }

    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn instance_changed(&self, instance: &ServiceInstance) -> usize {
        self.notify_service(&instance.key()).await
    }

    /// Push the service's current eligible instances to its subscribers
    pub async fn notify_service(&self, key: &ServiceKey) -> usize {
        let instances = match self.registry.eligible_instances(key).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = %key, error = %e, "Failed to load instances for push");
                return 0;
            }
        };
        let group_name = self.registry.group_name_of(key).await;

        let message = ServerMessage::ServiceChanged {
            namespace_id: key.service_group_id.clone(),
            group_name: group_name.clone(),
            service_name: key.service_name.clone(),
            instances,
        };
        let delivered = self
            .manager
            .broadcast_to_subscribers(
                |c| {
                    same_tenant(c, &key.tenant_id)
                        && c.is_subscribed_to_service(
                            &key.service_group_id,
                            &group_name,
                            &key.service_name,
                        )
                },
                &message,
            )
            .await;

        debug!(service = %key, delivered, "Service change pushed");
        delivered
    }

    /// Push a config change to connections watching that exact data id
    pub async fn config_changed(
        &self,
        tenant_id: &str,
        namespace_id: &str,
        group_name: &str,
        config_data_id: &str,
        action: EventAction,
        content: Option<serde_json::Value>,
    ) -> usize {
        let message = ServerMessage::ConfigChanged {
            namespace_id: namespace_id.to_string(),
            group_name: group_name.to_string(),
            config_data_id: config_data_id.to_string(),
            action,
            content,
        };
        self.manager
            .broadcast_to_subscribers(
                |c| {
                    same_tenant(c, tenant_id)
                        && c.is_watching_config(namespace_id, group_name, config_data_id)
                },
                &message,
            )
            .await
    }
}

/// Connections that never announced a tenant are not filtered out
fn same_tenant(connection: &StreamConnection, tenant_id: &str) -> bool {
    connection
        .tenant_id()
        .is_none_or(|own| own.is_empty() || tenant_id.is_empty() || own == tenant_id)
}
