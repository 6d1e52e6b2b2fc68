use std::sync::Arc;

use crate::connection::{ConnectionManager, PushNotifier};
use crate::events::{ClusterEventBus, EventPublisher};
use crate::registry::InstanceRegistry;

/// Handles to the coordination components, built once at process start and
/// passed to every consumer
#[derive(Clone)]
pub struct ClusterContext {
    pub registry: Arc<InstanceRegistry>,
    pub connections: ConnectionManager,
    pub notifier: Arc<PushNotifier>,
    pub event_bus: Arc<ClusterEventBus>,
    pub publisher: EventPublisher,
}

impl ClusterContext {
    #[must_use]
    pub fn new(
        registry: Arc<InstanceRegistry>,
        connections: ConnectionManager,
        event_bus: Arc<ClusterEventBus>,
    ) -> Self {
        let notifier = Arc::new(PushNotifier::new(connections.clone(), registry.clone()));
        let publisher = EventPublisher::new(event_bus.clone());
        Self {
            registry,
            connections,
            notifier,
            event_bus,
            publisher,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        self.event_bus.node_id()
    }
}
