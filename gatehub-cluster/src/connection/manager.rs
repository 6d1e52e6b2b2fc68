use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use gatehub_core::{config::ConnectionConfig, models::generate_id, Error, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{ServerMessage, CLOSE_REASON_CLIENT_TIMEOUT, CLOSE_REASON_SERVER_SHUTDOWN};
use super::stream_connection::{StreamConnection, StreamTransport};

/// Connection limits configuration
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Upper bound on one outbound send
    pub send_timeout: Duration,

    /// How long clients get to observe `SERVER_CLOSE` before being dropped
    pub close_grace_period: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            send_timeout: Duration::from_secs(5),
            close_grace_period: Duration::from_secs(1),
        }
    }
}

impl From<&ConnectionConfig> for ConnectionLimits {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            send_timeout: config.send_timeout(),
            close_grace_period: config.close_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_pushes: u64,
}

/// Index of live stream connections.
///
/// Cheap to clone; clones share the same index. Every connection scope is a
/// child of the manager's root token, so `close` cascades to all of them.
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<DashMap<String, Arc<StreamConnection>>>,
    limits: Arc<ConnectionLimits>,
    root_token: CancellationToken,

    total_connections: Arc<AtomicU64>,
    total_pushes: Arc<AtomicU64>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(limits: ConnectionLimits) -> Self {
        Self::with_parent(limits, &CancellationToken::new())
    }

    /// Derive the manager's root scope from an outer one
    #[must_use]
    pub fn with_parent(limits: ConnectionLimits, parent: &CancellationToken) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            limits: Arc::new(limits),
            root_token: parent.child_token(),
            total_connections: Arc::new(AtomicU64::new(0)),
            total_pushes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocate a connection id and index a new connection with a child scope
    pub fn create_connection(
        &self,
        transport: Box<dyn StreamTransport>,
        client_ip: &str,
    ) -> Result<Arc<StreamConnection>> {
        if self.root_token.is_cancelled() {
            return Err(Error::Transport("connection manager is closed".to_string()));
        }
        if self.connections.len() >= self.limits.max_connections {
            return Err(Error::Transport(format!(
                "Server at capacity ({} connections)",
                self.limits.max_connections
            )));
        }

        let connection = Arc::new(StreamConnection::new(
            generate_id(),
            client_ip,
            transport,
            self.root_token.child_token(),
            self.limits.send_timeout,
        ));
        self.connections
            .insert(connection.id().to_string(), connection.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %connection.id(),
            client_ip = %client_ip,
            total_connections = self.connections.len(),
            "Connection registered"
        );
        Ok(connection)
    }

    #[must_use]
    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<StreamConnection>> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    /// Snapshot of every connection; later index changes do not affect it
    #[must_use]
    pub fn get_all_connections(&self) -> Vec<Arc<StreamConnection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// Drop a connection from the index and cancel its scope
    pub fn remove_connection(&self, connection_id: &str) -> Option<Arc<StreamConnection>> {
        let (_, connection) = self.connections.remove(connection_id)?;
        connection.close();

        info!(
            connection_id = %connection_id,
            client_id = %connection.client_id(),
            duration = ?connection.connected_for(),
            "Connection unregistered"
        );
        Some(connection)
    }

    #[must_use]
    pub fn get_connections_by_client(&self, client_id: &str) -> Vec<Arc<StreamConnection>> {
        self.connections
            .iter()
            .filter(|c| c.value().client_id() == client_id)
            .map(|c| c.value().clone())
            .collect()
    }

    /// Send to every connection; returns the number of successful deliveries
    pub async fn broadcast_to_all(&self, message: &ServerMessage) -> usize {
        self.deliver(self.get_all_connections(), message).await
    }

    /// Send to the connections matching `filter`
    pub async fn broadcast_to_subscribers<F>(&self, filter: F, message: &ServerMessage) -> usize
    where
        F: Fn(&StreamConnection) -> bool,
    {
        let targets: Vec<_> = self
            .get_all_connections()
            .into_iter()
            .filter(|c| filter(c))
            .collect();
        self.deliver(targets, message).await
    }

    /// Send to one connection, counting it as a push
    pub async fn send_to(&self, connection: &StreamConnection, message: ServerMessage) -> Result<()> {
        connection.send(message).await?;
        self.total_pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Evict connections whose last ping is strictly older than `timeout`
    pub async fn cleanup_timeout_connections(&self, timeout: Duration) -> usize {
        let expired: Vec<_> = self
            .get_all_connections()
            .into_iter()
            .filter(|c| c.is_ping_timeout(timeout))
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let notice = ServerMessage::server_close(
            CLOSE_REASON_CLIENT_TIMEOUT,
            "heartbeat timeout",
            grace_millis(self.limits.close_grace_period),
        );
        join_all(expired.iter().map(|c| {
            let notice = notice.clone();
            async move {
                if let Err(e) = c.send(notice).await {
                    debug!(connection_id = %c.id(), error = %e, "Close notice not delivered");
                }
            }
        }))
        .await;

        let mut evicted = 0;
        for connection in &expired {
            warn!(
                connection_id = %connection.id(),
                client_id = %connection.client_id(),
                idle = ?connection.last_ping_time().elapsed(),
                "Connection ping timeout"
            );
            if self.remove_connection(connection.id()).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Graceful shutdown: notify, wait the grace period, drop everything
    pub async fn close(&self) {
        let notice = ServerMessage::server_close(
            CLOSE_REASON_SERVER_SHUTDOWN,
            "server is shutting down",
            grace_millis(self.limits.close_grace_period),
        );
        let notified = self.broadcast_to_all(&notice).await;
        info!(
            notified,
            grace = ?self.limits.close_grace_period,
            "Connection manager closing"
        );

        tokio::time::sleep(self.limits.close_grace_period).await;

        let ids: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.remove_connection(&id);
        }
        self.root_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.root_token.is_cancelled()
    }

    /// Spawn the periodic ping-timeout sweep; stops when the manager closes
    pub fn start_sweeper(&self, ping_timeout: Duration, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        let cancel_token = self.root_token.clone();
        let mut timer = tokio::time::interval(interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        debug!("Connection sweeper stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        let evicted = manager.cleanup_timeout_connections(ping_timeout).await;
                        if evicted > 0 {
                            info!(evicted, "Evicted timed out connections");
                        }
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            active_connections: self.connection_count(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_pushes: self.total_pushes.load(Ordering::Relaxed),
        }
    }

    async fn deliver(&self, targets: Vec<Arc<StreamConnection>>, message: &ServerMessage) -> usize {
        let results = join_all(targets.iter().map(|c| c.send(message.clone()))).await;

        let mut delivered = 0;
        for (connection, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    connection_id = %connection.id(),
                    message_type = message.kind(),
                    error = %e,
                    "Push to connection failed"
                ),
            }
        }
        self.total_pushes
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

fn grace_millis(grace: Duration) -> u64 {
    u64::try_from(grace.as_millis()).unwrap_or(u64::MAX)
}
