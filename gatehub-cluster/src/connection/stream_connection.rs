use std::time::Duration;

use async_trait::async_trait;
use gatehub_core::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::messages::ServerMessage;

/// Outbound half of a client stream
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn send(&self, message: ServerMessage) -> Result<()>;
}

/// Channel-backed transport; the receiving end feeds the socket writer
#[async_trait]
impl StreamTransport for mpsc::Sender<ServerMessage> {
    async fn send(&self, message: ServerMessage) -> Result<()> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| Error::Transport("outbound channel closed".to_string()))
    }
}

/// A service subscription; empty `service_names` means the whole group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSubscription {
    pub namespace_id: String,
    pub group_name: String,
    pub service_names: Vec<String>,
}

impl ServiceSubscription {
    #[must_use]
    pub fn matches(&self, namespace_id: &str, group_name: &str, service_name: &str) -> bool {
        self.namespace_id == namespace_id
            && self.group_name == group_name
            && (self.service_names.is_empty()
                || self.service_names.iter().any(|name| name == service_name))
    }
}

/// A config watch; data ids match exactly, there is no wildcard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigWatch {
    pub namespace_id: String,
    pub group_name: String,
    pub config_data_ids: Vec<String>,
}

impl ConfigWatch {
    #[must_use]
    pub fn matches(&self, namespace_id: &str, group_name: &str, config_data_id: &str) -> bool {
        self.namespace_id == namespace_id
            && self.group_name == group_name
            && self.config_data_ids.iter().any(|id| id == config_data_id)
    }
}

/// Metadata a client announces in `HELLO`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: String,
    pub tenant_id: Option<String>,
    pub namespace_id: Option<String>,
    pub language: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug)]
struct ConnectionState {
    client: ClientInfo,
    registered_nodes: Vec<String>,
    subscriptions: Vec<ServiceSubscription>,
    config_watches: Vec<ConfigWatch>,
    last_ping: Instant,
    last_active: Instant,
}

/// One live bidirectional stream.
///
/// Subscription and timestamp state sits behind a connection-local lock and
/// reads hand back copies. Outbound sends are serialized through their own
/// async mutex so pushes to one stream never interleave.
pub struct StreamConnection {
    id: String,
    client_ip: String,
    connected_at: Instant,
    state: RwLock<ConnectionState>,
    transport: Mutex<Box<dyn StreamTransport>>,
    cancel_token: CancellationToken,
    send_timeout: Duration,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("client_ip", &self.client_ip)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl StreamConnection {
    pub fn new(
        id: String,
        client_ip: impl Into<String>,
        transport: Box<dyn StreamTransport>,
        cancel_token: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            client_ip: client_ip.into(),
            connected_at: now,
            state: RwLock::new(ConnectionState {
                client: ClientInfo::default(),
                registered_nodes: Vec::new(),
                subscriptions: Vec::new(),
                config_watches: Vec::new(),
                last_ping: now,
                last_active: now,
            }),
            transport: Mutex::new(transport),
            cancel_token,
            send_timeout,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    #[must_use]
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    #[must_use]
    pub fn client_info(&self) -> ClientInfo {
        self.state.read().client.clone()
    }

    pub fn set_client_info(&self, client: ClientInfo) {
        self.state.write().client = client;
    }

    #[must_use]
    pub fn client_id(&self) -> String {
        self.state.read().client.client_id.clone()
    }

    /// Tenant announced by the client, if any
    #[must_use]
    pub fn tenant_id(&self) -> Option<String> {
        self.state.read().client.tenant_id.clone()
    }

    /// Record an instance this connection registered and is responsible for
    pub fn add_registered_node(&self, instance_id: &str) {
        let mut state = self.state.write();
        if !state.registered_nodes.iter().any(|id| id == instance_id) {
            state.registered_nodes.push(instance_id.to_string());
        }
    }

    pub fn remove_registered_node(&self, instance_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.registered_nodes.len();
        state.registered_nodes.retain(|id| id != instance_id);
        state.registered_nodes.len() != before
    }

    #[must_use]
    pub fn has_registered_nodes(&self) -> bool {
        !self.state.read().registered_nodes.is_empty()
    }

    #[must_use]
    pub fn registered_nodes(&self) -> Vec<String> {
        self.state.read().registered_nodes.clone()
    }

    #[must_use]
    pub fn owns_node(&self, instance_id: &str) -> bool {
        self.state
            .read()
            .registered_nodes
            .iter()
            .any(|id| id == instance_id)
    }

    /// Add a subscription, merging with an existing one for the same
    /// (namespace, group). A whole-group subscription absorbs named ones.
    pub fn add_service_subscription(&self, subscription: ServiceSubscription) {
        let mut state = self.state.write();
        let existing = state.subscriptions.iter_mut().find(|s| {
            s.namespace_id == subscription.namespace_id && s.group_name == subscription.group_name
        });

        match existing {
            Some(current) if current.service_names.is_empty() => {}
            Some(current) if subscription.service_names.is_empty() => {
                current.service_names.clear();
            }
            Some(current) => {
                for name in subscription.service_names {
                    if !current.service_names.contains(&name) {
                        current.service_names.push(name);
                    }
                }
            }
            None => state.subscriptions.push(subscription),
        }
    }

    #[must_use]
    pub fn is_subscribed_to_service(
        &self,
        namespace_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> bool {
        self.state
            .read()
            .subscriptions
            .iter()
            .any(|s| s.matches(namespace_id, group_name, service_name))
    }

    #[must_use]
    pub fn service_subscriptions(&self) -> Vec<ServiceSubscription> {
        self.state.read().subscriptions.clone()
    }

    pub fn add_config_watch(&self, watch: ConfigWatch) {
        let mut state = self.state.write();
        let existing = state
            .config_watches
            .iter_mut()
            .find(|w| w.namespace_id == watch.namespace_id && w.group_name == watch.group_name);

        match existing {
            Some(current) => {
                for id in watch.config_data_ids {
                    if !current.config_data_ids.contains(&id) {
                        current.config_data_ids.push(id);
                    }
                }
            }
            None => state.config_watches.push(watch),
        }
    }

    #[must_use]
    pub fn is_watching_config(
        &self,
        namespace_id: &str,
        group_name: &str,
        config_data_id: &str,
    ) -> bool {
        self.state
            .read()
            .config_watches
            .iter()
            .any(|w| w.matches(namespace_id, group_name, config_data_id))
    }

    #[must_use]
    pub fn config_watches(&self) -> Vec<ConfigWatch> {
        self.state.read().config_watches.clone()
    }

    pub fn update_last_ping_time(&self) {
        self.state.write().last_ping = Instant::now();
    }

    pub fn update_last_active_time(&self) {
        self.state.write().last_active = Instant::now();
    }

    #[must_use]
    pub fn last_ping_time(&self) -> Instant {
        self.state.read().last_ping
    }

    #[must_use]
    pub fn last_active_time(&self) -> Instant {
        self.state.read().last_active
    }

    /// Active unless the last activity is strictly older than `timeout`
    #[must_use]
    pub fn is_active(&self, timeout: Duration) -> bool {
        self.last_active_time().elapsed() <= timeout
    }

    /// Timed out only when the last ping is strictly older than `timeout`
    #[must_use]
    pub fn is_ping_timeout(&self, timeout: Duration) -> bool {
        self.last_ping_time().elapsed() > timeout
    }

    /// Send one message, bounded by the send timeout.
    ///
    /// Failures are `Transport` errors; the connection stays registered and
    /// is only evicted by the ping-timeout sweep.
    pub async fn send(&self, message: ServerMessage) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Transport(format!("connection {} is closed", self.id)));
        }

        let kind = message.kind();
        let send = async {
            let transport = self.transport.lock().await;
            transport.send(message).await
        };

        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!(
                "send of {kind} to connection {} timed out after {:?}",
                self.id, self.send_timeout
            ))),
        }
    }

    /// Cancel the connection scope; the session loop and transport observe it
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}
