use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use gatehub_core::{
    models::InstanceRegistration,
    Error, ErrorCode, Result,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::manager::ConnectionManager;
use super::messages::{ClientMessage, ServerMessage};
use super::push::PushNotifier;
use super::stream_connection::{
    ClientInfo, ConfigWatch, ServiceSubscription, StreamConnection, StreamTransport,
};
use crate::registry::InstanceRegistry;

/// Drives one bidirectional stream from open to close.
///
/// Owns the protocol state machine: inbound frames mutate the connection and
/// the registry, and each request-carrying frame gets a `RESULT` back.
pub struct StreamSession {
    connection: Arc<StreamConnection>,
    manager: ConnectionManager,
    registry: Arc<InstanceRegistry>,
    notifier: Arc<PushNotifier>,
    /// Tenant of each instance registered through this stream
    owned_tenants: Mutex<HashMap<String, String>>,
}

impl StreamSession {
    /// Index a new connection for `transport`
    pub fn open(
        manager: ConnectionManager,
        registry: Arc<InstanceRegistry>,
        notifier: Arc<PushNotifier>,
        transport: Box<dyn StreamTransport>,
        client_ip: &str,
    ) -> Result<Self> {
        let connection = manager.create_connection(transport, client_ip)?;
        Ok(Self {
            connection,
            manager,
            registry,
            notifier,
            owned_tenants: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<StreamConnection> {
        &self.connection
    }

    /// Announce the connection, then process text frames until the inbound
    /// side ends or the connection is closed. The connection is removed from
    /// the manager on the way out.
    pub async fn run<S>(self, inbound: S)
    where
        S: Stream<Item = String> + Send,
    {
        let connected = ServerMessage::Connected {
            connection_id: self.connection.id().to_string(),
            server_time: Utc::now(),
        };
        if let Err(e) = self.connection.send(connected).await {
            warn!(connection_id = %self.connection.id(), error = %e, "Failed to send CONNECTED");
        }

        let mut inbound = std::pin::pin!(inbound);
        loop {
            tokio::select! {
                () = self.connection.closed() => break,
                frame = inbound.next() => {
                    let Some(frame) = frame else { break };
                    if let Some(reply) = self.handle_text(&frame).await {
                        if let Err(e) = self.manager.send_to(&self.connection, reply).await {
                            warn!(
                                connection_id = %self.connection.id(),
                                error = %e,
                                "Failed to reply on stream"
                            );
                        }
                    }
                }
            }
        }

        let nodes = self.connection.registered_nodes();
        if !nodes.is_empty() {
            info!(
                connection_id = %self.connection.id(),
                nodes = ?nodes,
                "Stream ended with registered instances; left to heartbeat expiry"
            );
        }
        self.manager.remove_connection(self.connection.id());
    }

    /// Parse and handle one text frame
    pub async fn handle_text(&self, frame: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(frame) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                debug!(connection_id = %self.connection.id(), error = %e, "Malformed frame");
                Some(ServerMessage::failure(None, "INVALID_MESSAGE", e.to_string()))
            }
        }
    }

    /// Apply one inbound message; returns the reply to send, if any
    pub async fn handle_message(&self, message: ClientMessage) -> Option<ServerMessage> {
        self.connection.update_last_active_time();
        let request_id = message.request_id().map(ToString::to_string);

        let reply = match message {
            ClientMessage::Hello {
                client_id,
                tenant_id,
                namespace_id,
                language,
                version,
                ..
            } => {
                self.connection.set_client_info(ClientInfo {
                    client_id,
                    tenant_id,
                    namespace_id,
                    language,
                    version,
                });
                ServerMessage::ok(request_id, "hello")
            }
            ClientMessage::RegisterInstance { instance, .. } => {
                match self.register(instance).await {
                    Ok(value) => ServerMessage::ok(request_id, "registered").with_data(value),
                    Err(e) => ServerMessage::failure(
                        request_id,
                        e.reply_code("SERVICE_NOT_FOUND", "REGISTER_INSTANCE_FAILED"),
                        e.to_string(),
                    ),
                }
            }
            ClientMessage::DeregisterInstance {
                service_instance_id,
                ..
            } => match self.deregister(&service_instance_id).await {
                Ok(()) => ServerMessage::ok(request_id, "deregistered"),
                Err(e) => ServerMessage::failure(
                    request_id,
                    e.reply_code("INSTANCE_NOT_FOUND", "DEREGISTER_INSTANCE_FAILED"),
                    e.to_string(),
                ),
            },
            ClientMessage::SubscribeService {
                namespace_id,
                group_name,
                service_names,
                ..
            } => {
                self.connection.add_service_subscription(ServiceSubscription {
                    namespace_id,
                    group_name,
                    service_names,
                });
                ServerMessage::ok(request_id, "subscribed")
            }
            ClientMessage::WatchConfig {
                namespace_id,
                group_name,
                config_data_ids,
                ..
            } => {
                self.connection.add_config_watch(ConfigWatch {
                    namespace_id,
                    group_name,
                    config_data_ids,
                });
                ServerMessage::ok(request_id, "watching")
            }
            ClientMessage::Ping { .. } => {
                self.connection.update_last_ping_time();
                self.renew_owned_instances().await;
                ServerMessage::Pong {
                    request_id,
                    server_time: Utc::now(),
                }
            }
        };
        Some(reply)
    }

    async fn register(&self, mut registration: InstanceRegistration) -> Result<serde_json::Value> {
        let client = self.connection.client_info();
        if registration.tenant_id.is_empty() {
            registration.tenant_id = client.tenant_id.unwrap_or_default();
        }
        if registration.client_id.is_none() && !client.client_id.is_empty() {
            registration.client_id = Some(client.client_id);
        }

        let stored = self.registry.register_instance(registration).await?;
        self.connection
            .add_registered_node(&stored.service_instance_id);
        self.owned_tenants.lock().insert(
            stored.service_instance_id.clone(),
            stored.tenant_id.clone(),
        );
        self.notifier.instance_changed(&stored).await;
        Ok(serde_json::to_value(&stored)?)
    }

    async fn deregister(&self, instance_id: &str) -> Result<()> {
        let tenant_id = self
            .owned_tenants
            .lock()
            .get(instance_id)
            .cloned()
            .or_else(|| self.connection.tenant_id())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::validation(ErrorCode::MissingTenantId, "tenantId is required"))?;

        let operator = self.connection.client_id();
        let removed = self
            .registry
            .deregister_instance(&tenant_id, instance_id, &operator)
            .await?;
        self.connection.remove_registered_node(instance_id);
        self.owned_tenants.lock().remove(instance_id);
        self.notifier.instance_changed(&removed).await;
        Ok(())
    }

    /// Renew the heartbeat of every instance this stream registered.
    /// Instances the registry no longer knows are dropped from the stream.
    async fn renew_owned_instances(&self) {
        let owned: Vec<(String, String)> = self
            .owned_tenants
            .lock()
            .iter()
            .map(|(id, tenant)| (id.clone(), tenant.clone()))
            .collect();

        for (instance_id, tenant_id) in owned {
            match self.registry.heartbeat(&tenant_id, &instance_id).await {
                Ok(outcome) if outcome.restored => {
                    self.notifier.instance_changed(&outcome.instance).await;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(instance_id = %instance_id, "Owned instance is gone, forgetting it");
                    self.connection.remove_registered_node(&instance_id);
                    self.owned_tenants.lock().remove(&instance_id);
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Heartbeat renewal failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionLimits;
    use gatehub_core::config::RegistryConfig;
    use gatehub_core::models::HealthStatus;
    use gatehub_core::repository::MemoryRegistryStore;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        session: StreamSession,
        registry: Arc<InstanceRegistry>,
        manager: ConnectionManager,
        outbound: mpsc::Receiver<ServerMessage>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(InstanceRegistry::new(
            Arc::new(MemoryRegistryStore::new()),
            &RegistryConfig::default(),
        ));
        let manager = ConnectionManager::new(ConnectionLimits::default());
        let notifier = Arc::new(PushNotifier::new(manager.clone(), registry.clone()));
        let (tx, outbound) = mpsc::channel(32);
        let session = StreamSession::open(
            manager.clone(),
            registry.clone(),
            notifier,
            Box::new(tx),
            "10.2.0.1",
        )
        .unwrap();
        Harness {
            session,
            registry,
            manager,
            outbound,
        }
    }

    fn frame(value: serde_json::Value) -> String {
        value.to_string()
    }

    #[tokio::test]
    async fn test_register_over_stream_uses_hello_tenant() {
        let h = harness();
        h.session
            .handle_text(&frame(json!({"type": "HELLO", "clientId": "gw-a", "tenantId": "t1"})))
            .await;

        let reply = h
            .session
            .handle_text(&frame(json!({
                "type": "REGISTER_INSTANCE",
                "requestId": "r1",
                "instance": {
                    "serviceGroupId": "g1",
                    "serviceName": "orders",
                    "serviceInstanceId": "o-1",
                    "hostAddress": "10.0.0.1",
                    "portNumber": 8080
                }
            })))
            .await
            .unwrap();

        match reply {
            ServerMessage::Result {
                success,
                request_id,
                data,
                ..
            } => {
                assert!(success);
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(data.unwrap()["clientId"], "gw-a");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.session.connection().owns_node("o-1"));
        let listed = h.registry.list_instances("t1", "g1", "orders").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_register_validation_code() {
        let h = harness();
        let reply = h
            .session
            .handle_message(ClientMessage::RegisterInstance {
                request_id: None,
                instance: InstanceRegistration::new("t1", "g1", "orders", "o-1", "10.0.0.1", 0),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            ServerMessage::Result { success: false, ref code, .. } if code == "INVALID_PORT_NUMBER"
        ));
    }

    #[tokio::test]
    async fn test_ping_renews_owned_instance() {
        let h = harness();
        h.session
            .handle_message(ClientMessage::RegisterInstance {
                request_id: None,
                instance: InstanceRegistration::new("t1", "g1", "orders", "o-1", "10.0.0.1", 80),
            })
            .await;
        h.registry
            .update_instance_status(
                "t1",
                "o-1",
                gatehub_core::models::InstanceStatus::Up,
                Some(HealthStatus::Unhealthy),
                None,
            )
            .await
            .unwrap();

        let reply = h
            .session
            .handle_message(ClientMessage::Ping { request_id: None })
            .await;
        assert!(matches!(reply, Some(ServerMessage::Pong { .. })));

        let listed = h.registry.list_instances("t1", "g1", "orders").await.unwrap();
        assert_eq!(listed[0].health_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_ping_forgets_vanished_instance() {
        let h = harness();
        h.session
            .handle_message(ClientMessage::RegisterInstance {
                request_id: None,
                instance: InstanceRegistration::new("t1", "g1", "orders", "o-1", "10.0.0.1", 80),
            })
            .await;
        h.registry.deregister_instance("t1", "o-1", "admin").await.unwrap();

        h.session
            .handle_message(ClientMessage::Ping { request_id: None })
            .await;
        assert!(!h.session.connection().has_registered_nodes());
    }

    #[tokio::test]
    async fn test_deregister_unknown_instance() {
        let h = harness();
        h.session
            .handle_text(&frame(json!({"type": "HELLO", "clientId": "c", "tenantId": "t1"})))
            .await;
        let reply = h
            .session
            .handle_message(ClientMessage::DeregisterInstance {
                request_id: None,
                service_instance_id: "ghost".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            ServerMessage::Result { ref code, .. } if code == "INSTANCE_NOT_FOUND"
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let h = harness();
        let reply = h.session.handle_text("{not json").await.unwrap();
        assert!(matches!(
            reply,
            ServerMessage::Result { success: false, ref code, .. } if code == "INVALID_MESSAGE"
        ));
    }

    #[tokio::test]
    async fn test_run_sends_connected_and_removes_on_end() {
        let mut h = harness();
        let id = h.session.connection().id().to_string();
        let frames = futures::stream::iter(vec![frame(json!({"type": "PING", "requestId": "p"}))]);

        h.session.run(frames).await;

        assert!(matches!(h.outbound.recv().await, Some(ServerMessage::Connected { .. })));
        assert!(matches!(h.outbound.recv().await, Some(ServerMessage::Pong { .. })));
        assert!(h.manager.get_connection(&id).is_none());
    }
}
