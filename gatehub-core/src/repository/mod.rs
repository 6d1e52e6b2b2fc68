//! Persistence seams for the registry and the cluster event bus.
//!
//! The relational store is the authority; both traits have an in-memory
//! implementation (single-node mode, tests) and a Postgres one.

pub mod event;
pub mod memory;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ClusterEvent, ClusterEventAck, Service, ServiceInstance, ServiceKey};
use crate::Result;

pub use event::PgEventStore;
pub use memory::{MemoryEventStore, MemoryRegistryStore};
pub use registry::PgRegistryStore;

/// Result of a heartbeat renewal
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub instance: ServiceInstance,
    /// The instance was UNHEALTHY and the heartbeat brought it back
    pub restored: bool,
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Insert or re-activate a service; returns the stored row
    async fn upsert_service(&self, service: &Service) -> Result<Service>;

    /// Active service by identity
    async fn get_service(&self, key: &ServiceKey) -> Result<Option<Service>>;

    /// Logical delete. `false` when no active service matched.
    async fn deactivate_service(&self, key: &ServiceKey, operator: &str) -> Result<bool>;

    /// Insert or replace an instance keyed by (tenant, instance id).
    /// A replaced instance keeps its insertion position.
    async fn upsert_instance(&self, instance: &ServiceInstance) -> Result<ServiceInstance>;

    async fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<Option<ServiceInstance>>;

    /// Compare-and-swap write of the mutable columns.
    ///
    /// Fails with `OptimisticLockConflict` when the stored version is not
    /// `expected_version`, and with `NotFound` when no active row exists.
    async fn update_instance(
        &self,
        instance: &ServiceInstance,
        expected_version: i64,
    ) -> Result<ServiceInstance>;

    /// Logical delete; returns the row as it was deactivated
    async fn deactivate_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        operator: &str,
    ) -> Result<Option<ServiceInstance>>;

    /// Renew `last_heartbeat`; an UNHEALTHY instance is restored to HEALTHY
    async fn touch_heartbeat(
        &self,
        tenant_id: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<HeartbeatOutcome>>;

    /// Active instances of a service, any status, in insertion order
    async fn list_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>>;

    /// Flip HEALTHY instances whose last heartbeat is before `cutoff` to
    /// UNHEALTHY; returns the affected rows
    async fn mark_stale_unhealthy(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>>;

    /// Deactivate temp instances whose last heartbeat is before `cutoff`
    async fn expire_temp_instances(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>>;
}

/// One row of the event log as read by the dispatcher
#[derive(Debug, Clone)]
pub enum StoredEvent {
    Event(ClusterEvent),
    /// The row exists but its type, action or payload cannot be read
    Undecodable {
        event_id: String,
        tenant_id: String,
        reason: String,
    },
}

impl StoredEvent {
    #[must_use]
    pub fn event_id(&self) -> &str {
        match self {
            Self::Event(event) => &event.event_id,
            Self::Undecodable { event_id, .. } => event_id,
        }
    }
}

/// Keyset position in the pending-ack listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPosition {
    pub add_time: DateTime<Utc>,
    pub ack_id: String,
}

impl From<&ClusterEventAck> for AckPosition {
    fn from(ack: &ClusterEventAck) -> Self {
        Self {
            add_time: ack.audit.add_time,
            ack_id: ack.ack_id.clone(),
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event and return its monotonically increasing sequence
    async fn insert_event(&self, event: &ClusterEvent) -> Result<i64>;

    async fn get_event(&self, event_id: &str) -> Result<Option<ClusterEvent>>;

    /// Events in the log with no ack for `node_id`, event time at or after
    /// `since`, oldest first. Expired events are included.
    ///
    /// A row that no longer decodes comes back as [`StoredEvent::Undecodable`]
    /// instead of failing the whole batch.
    async fn list_unacked_events(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredEvent>>;

    /// Create the ack for (event, node). `false` if one already exists.
    async fn insert_ack(&self, ack: &ClusterEventAck) -> Result<bool>;

    async fn get_ack(&self, event_id: &str, node_id: &str) -> Result<Option<ClusterEventAck>>;

    /// Compare-and-swap write of a PENDING ack.
    ///
    /// Terminal acks are never rewritten: writing one fails with
    /// `OptimisticLockConflict`, as does a version mismatch.
    async fn update_ack(&self, ack: &ClusterEventAck, expected_version: i64)
        -> Result<ClusterEventAck>;

    /// PENDING acks owned by `node_id` ordered by (add time, ack id),
    /// starting strictly after `after` when given
    async fn list_pending_acks(
        &self,
        node_id: &str,
        after: Option<AckPosition>,
        limit: i64,
    ) -> Result<Vec<ClusterEventAck>>;

    /// Delete events (and their acks) with an event time before `cutoff`
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Audit columns shared by every table
pub(crate) const AUDIT_COLUMNS: &str = "add_time, add_who, edit_time, edit_who, version, \
     active_flag, note_text, ext_property, reserved1, reserved2, reserved3";

pub(crate) fn audit_from_row(row: &sqlx::postgres::PgRow) -> Result<crate::models::AuditFields> {
    use sqlx::Row;

    let active_flag: String = row.try_get("active_flag")?;
    Ok(crate::models::AuditFields {
        add_time: row.try_get("add_time")?,
        add_who: row.try_get("add_who")?,
        edit_time: row.try_get("edit_time")?,
        edit_who: row.try_get("edit_who")?,
        version: row.try_get("version")?,
        active_flag: active_flag.trim().parse()?,
        note_text: row.try_get("note_text")?,
        ext_property: row.try_get("ext_property")?,
        reserved1: row.try_get("reserved1")?,
        reserved2: row.try_get("reserved2")?,
        reserved3: row.try_get("reserved3")?,
    })
}
