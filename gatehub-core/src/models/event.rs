use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::audit::AuditFields;
use super::id::generate_id;

/// Closed set of event-type tags known at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    GatewayInstance,
    AlertConfig,
    ConfigSync,
}

text_enum!(EventType, "event type", {
    GatewayInstance => "GATEWAY_INSTANCE",
    AlertConfig => "ALERT_CONFIG",
    ConfigSync => "CONFIG_SYNC",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Start,
    Stop,
    Reload,
    Restart,
    Register,
    Unregister,
    ConfigUpdated,
    ConfigDeleted,
}

text_enum!(EventAction, "event action", {
    Start => "START",
    Stop => "STOP",
    Reload => "RELOAD",
    Restart => "RESTART",
    Register => "REGISTER",
    Unregister => "UNREGISTER",
    ConfigUpdated => "CONFIG_UPDATED",
    ConfigDeleted => "CONFIG_DELETED",
});

/// Per-node acknowledgment state. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Skipped,
}

text_enum!(AckStatus, "ack status", {
    Pending => "PENDING",
    Success => "SUCCESS",
    Failed => "FAILED",
    Skipped => "SKIPPED",
});

impl AckStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Administrative state-change notification fanned out to every node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub source_node_id: String,
    pub source_node_ip: String,
    pub event_type: EventType,
    pub event_action: EventAction,
    pub event_payload: serde_json::Value,
    pub event_time: DateTime<Utc>,
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl ClusterEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: EventType,
        event_action: EventAction,
        event_payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: String::new(),
            tenant_id: tenant_id.into(),
            source_node_id: String::new(),
            source_node_ip: String::new(),
            event_type,
            event_action,
            event_payload,
            event_time: Utc::now(),
            expire_time: None,
            audit: AuditFields::default(),
        }
    }

    #[must_use]
    pub fn with_expire_in(mut self, ttl: Duration) -> Self {
        self.expire_time = Some(self.event_time + ttl);
        self
    }

    #[must_use]
    pub fn with_expire_time(mut self, expire_time: DateTime<Utc>) -> Self {
        self.expire_time = Some(expire_time);
        self
    }

    /// Assign an id if the publisher did not set one
    pub fn ensure_id(&mut self) {
        if self.event_id.is_empty() {
            self.event_id = generate_id();
        }
    }

    /// Authoritative expiry check: an expired event is never handled
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|expire| now > expire)
    }
}

/// Per-node processing record for one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEventAck {
    pub ack_id: String,
    pub tenant_id: String,
    pub event_id: String,
    pub node_id: String,
    pub node_ip: String,
    pub ack_status: AckStatus,
    pub process_time: Option<DateTime<Utc>>,
    pub result_message: Option<String>,
    pub retry_count: i32,
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl ClusterEventAck {
    #[must_use]
    pub fn pending(event: &ClusterEvent, node_id: &str, node_ip: &str) -> Self {
        Self::pending_for(&event.tenant_id, &event.event_id, node_id, node_ip)
    }

    /// PENDING ack built from the event's identity columns alone
    #[must_use]
    pub fn pending_for(tenant_id: &str, event_id: &str, node_id: &str, node_ip: &str) -> Self {
        Self {
            ack_id: generate_id(),
            tenant_id: tenant_id.to_string(),
            event_id: event_id.to_string(),
            node_id: node_id.to_string(),
            node_ip: node_ip.to_string(),
            ack_status: AckStatus::Pending,
            process_time: None,
            result_message: None,
            retry_count: 0,
            audit: AuditFields::new(node_id),
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.ack_status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tags_parse_from_text() {
        assert_eq!("CONFIG_SYNC".parse::<EventType>().unwrap(), EventType::ConfigSync);
        assert_eq!("RESTART".parse::<EventAction>().unwrap(), EventAction::Restart);
        assert_eq!("SKIPPED".parse::<AckStatus>().unwrap(), AckStatus::Skipped);

        let err = "TUNNEL".parse::<EventType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown event type value: TUNNEL");
        assert!("config_sync".parse::<EventType>().is_err());
    }

    #[test]
    fn test_expiry() {
        let event = ClusterEvent::new("t1", EventType::ConfigSync, EventAction::ConfigUpdated, json!({}));
        assert!(!event.is_expired());

        let expired = event
            .clone()
            .with_expire_time(Utc::now() - Duration::seconds(1));
        assert!(expired.is_expired());

        let fresh = event.with_expire_in(Duration::minutes(10));
        assert!(!fresh.is_expired());
        assert!(fresh.is_expired_at(fresh.event_time + Duration::minutes(11)));
    }

    #[test]
    fn test_expiry_boundary_is_strict() {
        let event = ClusterEvent::new("t1", EventType::AlertConfig, EventAction::Reload, json!({}))
            .with_expire_in(Duration::seconds(5));
        let expire = event.expire_time.unwrap();
        assert!(!event.is_expired_at(expire));
        assert!(event.is_expired_at(expire + Duration::milliseconds(1)));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!AckStatus::Pending.is_terminal());
        assert!(AckStatus::Success.is_terminal());
        assert!(AckStatus::Failed.is_terminal());
        assert!(AckStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_pending_ack_references_event() {
        let mut event = ClusterEvent::new("t1", EventType::GatewayInstance, EventAction::Start, json!({"instanceId": "gw-1"}));
        event.ensure_id();
        let ack = ClusterEventAck::pending(&event, "node-a", "10.0.0.9");
        assert_eq!(ack.event_id, event.event_id);
        assert_eq!(ack.ack_status, AckStatus::Pending);
        assert_eq!(ack.retry_count, 0);
    }

    #[test]
    fn test_event_type_serde_matches_text() {
        let json = serde_json::to_string(&EventType::GatewayInstance).unwrap();
        assert_eq!(json, format!("\"{}\"", EventType::GatewayInstance.as_str()));
    }
}
