use std::sync::Arc;

use chrono::Duration;
use gatehub_core::models::{ClusterEvent, EventAction, EventType};
use serde_json::json;
use tracing::{debug, warn};

use super::bus::ClusterEventBus;

/// Fire-and-forget publishing for controllers.
///
/// Callers have already committed their own state change, so nothing here
/// returns an error: a bus that is not ready drops the event with a debug
/// line and a failed write is logged.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<ClusterEventBus>,
    default_ttl: Duration,
}

impl EventPublisher {
    #[must_use]
    pub fn new(bus: Arc<ClusterEventBus>) -> Self {
        let default_ttl = Duration::seconds(bus.config().default_expire_secs);
        Self { bus, default_ttl }
    }

    /// Publish with the default expiry unless one is set. Returns the event
    /// id when the event was stored.
    pub async fn publish(&self, mut event: ClusterEvent) -> Option<String> {
        if !self.bus.is_ready() {
            debug!(
                event_type = %event.event_type,
                action = %event.event_action,
                "Cluster event bus not ready, event dropped"
            );
            return None;
        }
        if event.expire_time.is_none() {
            event = event.with_expire_in(self.default_ttl);
        }

        let event_type = event.event_type;
        match self.bus.publish_event(event).await {
            Ok(stored) => Some(stored.event_id),
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "Failed to publish cluster event");
                None
            }
        }
    }

    pub async fn publish_gateway_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        action: EventAction,
    ) -> Option<String> {
        self.publish(ClusterEvent::new(
            tenant_id,
            EventType::GatewayInstance,
            action,
            json!({ "instanceId": instance_id }),
        ))
        .await
    }

    pub async fn publish_alert_config(
        &self,
        tenant_id: &str,
        action: EventAction,
        payload: serde_json::Value,
    ) -> Option<String> {
        self.publish(ClusterEvent::new(
            tenant_id,
            EventType::AlertConfig,
            action,
            payload,
        ))
        .await
    }

    pub async fn publish_config_change(
        &self,
        tenant_id: &str,
        namespace_id: &str,
        group_name: &str,
        config_data_id: &str,
        action: EventAction,
        content: Option<serde_json::Value>,
    ) -> Option<String> {
        self.publish(ClusterEvent::new(
            tenant_id,
            EventType::ConfigSync,
            action,
            json!({
                "namespaceId": namespace_id,
                "groupName": group_name,
                "configDataId": config_data_id,
                "content": content,
            }),
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use gatehub_core::config::EventBusConfig;
    use gatehub_core::models::ClusterEventAck;
    use gatehub_core::repository::{AckPosition, EventStore, MemoryEventStore, StoredEvent};
    use gatehub_core::{Error, Result};
    use mockall::mock;

    mock! {
        pub Store {}

        #[async_trait]
        impl EventStore for Store {
            async fn insert_event(&self, event: &ClusterEvent) -> Result<i64>;
            async fn get_event(&self, event_id: &str) -> Result<Option<ClusterEvent>>;
            async fn list_unacked_events(&self, node_id: &str, since: DateTime<Utc>, limit: i64) -> Result<Vec<StoredEvent>>;
            async fn insert_ack(&self, ack: &ClusterEventAck) -> Result<bool>;
            async fn get_ack(&self, event_id: &str, node_id: &str) -> Result<Option<ClusterEventAck>>;
            async fn update_ack(&self, ack: &ClusterEventAck, expected_version: i64) -> Result<ClusterEventAck>;
            async fn list_pending_acks(&self, node_id: &str, after: Option<AckPosition>, limit: i64) -> Result<Vec<ClusterEventAck>>;
            async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
        }
    }

    #[tokio::test]
    async fn test_not_ready_drops_without_touching_store() {
        let mut store = MockStore::new();
        store.expect_insert_event().never();
        let bus = Arc::new(ClusterEventBus::new(
            Arc::new(store),
            "node-a",
            "10.0.0.1",
            EventBusConfig::default(),
        ));

        let publisher = EventPublisher::new(bus);
        assert!(publisher
            .publish_gateway_instance("t1", "gw-1", EventAction::Start)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let mut store = MockStore::new();
        store
            .expect_list_unacked_events()
            .returning(|_, _, _| Ok(Vec::new()));
        store
            .expect_insert_event()
            .times(1)
            .returning(|_| Err(Error::Internal("database unavailable".to_string())));
        let bus = Arc::new(ClusterEventBus::new(
            Arc::new(store),
            "node-a",
            "10.0.0.1",
            EventBusConfig::default(),
        ));
        bus.prime().await.unwrap();

        let publisher = EventPublisher::new(bus);
        let published = publisher
            .publish_alert_config("t1", EventAction::Reload, json!({"channelId": "c"}))
            .await;
        assert!(published.is_none());
    }

    #[tokio::test]
    async fn test_config_change_gets_default_expiry() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = Arc::new(ClusterEventBus::new(
            store.clone(),
            "node-a",
            "10.0.0.1",
            EventBusConfig {
                default_expire_secs: 600,
                ..Default::default()
            },
        ));
        bus.prime().await.unwrap();

        let publisher = EventPublisher::new(bus);
        let id = publisher
            .publish_config_change(
                "t1",
                "g1",
                "DEFAULT_GROUP",
                "routes.yaml",
                EventAction::ConfigUpdated,
                None,
            )
            .await
            .unwrap();

        let event = store.get_event(&id).await.unwrap().unwrap();
        let ttl = event.expire_time.unwrap() - event.event_time;
        assert_eq!(ttl, Duration::minutes(10));
        assert_eq!(event.event_payload["configDataId"], "routes.yaml");
    }
}
