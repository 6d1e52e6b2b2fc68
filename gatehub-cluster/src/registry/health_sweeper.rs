//! Heartbeat-driven liveness sweep for registered instances
//!
//! The registry never ages instances on its own; this task does.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gatehub_core::{config::RegistryConfig, models::ServiceKey, Result};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::InstanceRegistry;
use crate::connection::PushNotifier;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_unhealthy: usize,
    pub expired_temp: usize,
}

pub struct InstanceHealthSweeper {
    registry: Arc<InstanceRegistry>,
    notifier: Option<Arc<PushNotifier>>,
    heartbeat_timeout: Duration,
    temp_instance_expire: Duration,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
}

impl InstanceHealthSweeper {
    #[must_use]
    pub fn new(registry: Arc<InstanceRegistry>, config: &RegistryConfig) -> Self {
        Self {
            registry,
            notifier: None,
            heartbeat_timeout: config.heartbeat_timeout(),
            temp_instance_expire: config.temp_instance_expire(),
            sweep_interval: config.sweep_interval(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Push `SERVICE_CHANGED` to subscribers of every affected service
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<PushNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Run one pass: stale instances become UNHEALTHY, stale temp instances
    /// are deregistered
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let stale_cutoff = now - chrono_duration(self.heartbeat_timeout);
        let temp_cutoff = now - chrono_duration(self.temp_instance_expire);

        let unhealthy = self.registry.mark_stale(stale_cutoff).await?;
        let expired = self.registry.expire_temp(temp_cutoff).await?;

        let touched: BTreeSet<ServiceKey> = unhealthy
            .iter()
            .chain(expired.iter())
            .map(|i| i.key())
            .collect();

        for instance in &unhealthy {
            warn!(
                instance_id = %instance.service_instance_id,
                service = %instance.key(),
                last_heartbeat = %instance.last_heartbeat,
                "Instance heartbeat timed out, marked UNHEALTHY"
            );
        }
        for instance in &expired {
            info!(
                instance_id = %instance.service_instance_id,
                service = %instance.key(),
                "Temp instance expired and deregistered"
            );
        }

        if let Some(notifier) = &self.notifier {
            for key in &touched {
                notifier.notify_service(key).await;
            }
        }

        Ok(SweepReport {
            marked_unhealthy: unhealthy.len(),
            expired_temp: expired.len(),
        })
    }

    /// Spawn the periodic sweep
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(self.sweep_interval);

        tokio::spawn(async move {
            info!(
                interval = ?self.sweep_interval,
                heartbeat_timeout = ?self.heartbeat_timeout,
                "Instance health sweeper started"
            );
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Instance health sweeper shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            warn!(error = %e, "Instance health sweep failed");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
