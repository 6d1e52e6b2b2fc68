//! Server lifecycle management
//!
//! Starts the background loops and the HTTP server, then tears them down
//! in order on SIGTERM or Ctrl+C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use gatehub_api::{create_router, AppState};
use gatehub_cluster::{ClusterContext, InstanceHealthSweeper};
use gatehub_core::Config;

/// Upper bound for background tasks to finish after cancellation
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GateHubServer {
    config: Config,
    cluster: ClusterContext,
    sweeper: Arc<InstanceHealthSweeper>,
}

impl GateHubServer {
    pub const fn new(
        config: Config,
        cluster: ClusterContext,
        sweeper: Arc<InstanceHealthSweeper>,
    ) -> Self {
        Self {
            config,
            cluster,
            sweeper,
        }
    }

    /// Start all components and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        info!(node_id = %self.cluster.node_id(), "Starting GateHub server...");

        let mut background = self.cluster.event_bus.start().await?;
        info!("Cluster event bus started");

        background.push(self.sweeper.clone().start());
        background.push(self.cluster.connections.start_sweeper(
            self.config.connection.ping_timeout(),
            self.config.connection.sweep_interval(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut http_handle = self.start_http_server(shutdown_rx).await?;

        tokio::select! {
            result = &mut http_handle => {
                if let Err(e) = result {
                    error!("HTTP server task failed: {}", e);
                }
                warn!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        // Open streams keep graceful shutdown waiting until close() drops them
        let _ = shutdown_tx.send(true);
        self.cluster.connections.close().await;

        self.cluster.event_bus.shutdown();
        self.sweeper.shutdown();

        for handle in background {
            if tokio::time::timeout(TASK_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Background task did not stop within {:?}", TASK_DRAIN_TIMEOUT);
            }
        }
        if !http_handle.is_finished()
            && tokio::time::timeout(TASK_DRAIN_TIMEOUT, http_handle).await.is_err()
        {
            warn!("HTTP server did not drain within {:?}", TASK_DRAIN_TIMEOUT);
        }

        info!("GateHub server stopped");
        Ok(())
    }

    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_addr: SocketAddr = self
            .config
            .http_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{}': {e}", self.config.http_address()))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let state = AppState::new(self.cluster.clone(), self.config.connection.outbound_buffer);
        let router = create_router(state);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(graceful)
            .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
