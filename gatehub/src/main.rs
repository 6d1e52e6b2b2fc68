mod migrations;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use gatehub_cluster::{
    events::{AlertConfigHandler, ConfigSyncHandler, GatewayInstanceHandler},
    global, ClusterContext, ClusterEventBus, ConnectionLimits, ConnectionManager,
    InstanceHealthSweeper, InstanceRegistry,
};
use gatehub_core::{
    config::{load_config, Config},
    logging,
    repository::{
        EventStore, MemoryEventStore, MemoryRegistryStore, PgEventStore, PgRegistryStore,
        RegistryStore,
    },
};

use server::GateHubServer;

/// Local address used for outbound traffic, or 0.0.0.0 when offline
fn detect_local_ip() -> String {
    use std::net::UdpSocket;

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "0.0.0.0".to_string(), |addr| addr.ip().to_string())
}

/// Configured node identity, falling back to `hostname_ip-suffix`
fn resolve_node_identity(config: &Config) -> (String, String) {
    let node_ip = if config.node.node_ip.is_empty() {
        detect_local_ip()
    } else {
        config.node.node_ip.clone()
    };

    let node_id = if config.node.node_id.is_empty() {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        format!("{hostname}_{node_ip}-{}", nanoid::nanoid!(6))
    } else {
        config.node.node_id.clone()
    };

    (node_id, node_ip)
}

async fn init_stores(config: &Config) -> Result<(Arc<dyn RegistryStore>, Arc<dyn EventStore>)> {
    if !config.uses_database() {
        warn!("No database configured, using in-memory stores (single node only)");
        return Ok((
            Arc::new(MemoryRegistryStore::new()),
            Arc::new(MemoryEventStore::new()),
        ));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {e}"))?;
    info!(
        max_connections = config.database.max_connections,
        "Database pool initialized"
    );

    migrations::run_migrations(&pool).await?;

    Ok((
        Arc::new(PgRegistryStore::new(pool.clone())),
        Arc::new(PgEventStore::new(pool)),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration (validated on load)
    let config = load_config()?;

    // 2. Logging
    logging::init_logging(&config.logging)?;
    info!("GateHub starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Storage
    let (registry_store, event_store) = init_stores(&config).await?;

    // 4. Node identity
    let (node_id, node_ip) = resolve_node_identity(&config);
    info!(node_id = %node_id, node_ip = %node_ip, "Node identity resolved");

    // 5. Coordination components
    let registry = Arc::new(InstanceRegistry::new(registry_store, &config.registry));
    let limits = ConnectionLimits::from(&config.connection);
    info!(
        max_connections = limits.max_connections,
        send_timeout = ?limits.send_timeout,
        "Connection manager initialized"
    );
    let connections = ConnectionManager::new(limits);
    let event_bus = Arc::new(ClusterEventBus::new(
        event_store,
        node_id,
        node_ip,
        config.event_bus.clone(),
    ));
    let cluster = ClusterContext::new(registry.clone(), connections.clone(), event_bus.clone());

    // 6. Event handlers
    event_bus.register_handler(Arc::new(ConfigSyncHandler::new(cluster.notifier.clone())));
    event_bus.register_handler(Arc::new(GatewayInstanceHandler::new(connections.clone())));
    event_bus.register_handler(Arc::new(AlertConfigHandler::new(connections)));

    // 7. Process-wide handle for callers outside the request path
    if global::install(cluster.clone()).is_err() {
        warn!("Cluster context was already installed");
    }

    let sweeper = Arc::new(
        InstanceHealthSweeper::new(registry, &config.registry)
            .with_notifier(cluster.notifier.clone()),
    );

    // 8. Run until shutdown
    GateHubServer::new(config, cluster, sweeper).start().await
}
