use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;

use super::{AckPosition, EventStore, HeartbeatOutcome, RegistryStore, StoredEvent};
use crate::models::{
    AckStatus, ClusterEvent, ClusterEventAck, Flag, HealthStatus, Service, ServiceInstance,
    ServiceKey,
};
use crate::{Error, Result};

type InstanceKey = (String, String);

fn instance_key(tenant_id: &str, instance_id: &str) -> InstanceKey {
    (tenant_id.to_string(), instance_id.to_string())
}

/// Registry store backed by process memory.
///
/// Instances live in one `IndexMap` so listing preserves insertion order.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    services: RwLock<HashMap<ServiceKey, Service>>,
    instances: RwLock<IndexMap<InstanceKey, ServiceInstance>>,
}

impl MemoryRegistryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn upsert_service(&self, service: &Service) -> Result<Service> {
        let mut services = self.services.write();
        let mut stored = service.clone();
        if let Some(existing) = services.get(&service.key()) {
            stored.audit.add_time = existing.audit.add_time;
            stored.audit.add_who.clone_from(&existing.audit.add_who);
            stored.audit.version = existing.audit.version + 1;
        }
        stored.audit.active_flag = Flag::Y;
        services.insert(stored.key(), stored.clone());
        Ok(stored)
    }

    async fn get_service(&self, key: &ServiceKey) -> Result<Option<Service>> {
        Ok(self
            .services
            .read()
            .get(key)
            .filter(|s| s.audit.is_active())
            .cloned())
    }

    async fn deactivate_service(&self, key: &ServiceKey, operator: &str) -> Result<bool> {
        let mut services = self.services.write();
        match services.get_mut(key) {
            Some(service) if service.audit.is_active() => {
                service.audit.active_flag = Flag::N;
                service.audit.touch(operator);
                service.audit.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_instance(&self, instance: &ServiceInstance) -> Result<ServiceInstance> {
        let mut instances = self.instances.write();
        let key = instance_key(&instance.tenant_id, &instance.service_instance_id);
        let mut stored = instance.clone();
        if let Some(existing) = instances.get(&key) {
            stored.audit.add_time = existing.audit.add_time;
            stored.audit.add_who.clone_from(&existing.audit.add_who);
            stored.audit.version = existing.audit.version + 1;
        }
        stored.audit.active_flag = Flag::Y;
        instances.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<Option<ServiceInstance>> {
        Ok(self
            .instances
            .read()
            .get(&instance_key(tenant_id, instance_id))
            .filter(|i| i.audit.is_active())
            .cloned())
    }

    async fn update_instance(
        &self,
        instance: &ServiceInstance,
        expected_version: i64,
    ) -> Result<ServiceInstance> {
        let mut instances = self.instances.write();
        let key = instance_key(&instance.tenant_id, &instance.service_instance_id);
        let stored = instances
            .get_mut(&key)
            .filter(|i| i.audit.is_active())
            .ok_or_else(|| Error::NotFound(format!("instance {}", instance.service_instance_id)))?;
        if stored.audit.version != expected_version {
            return Err(Error::OptimisticLockConflict);
        }

        // Heartbeat and registration columns are owned by other writers
        let last_heartbeat = stored.last_heartbeat;
        let register_time = stored.register_time;
        let add_time = stored.audit.add_time;
        let add_who = std::mem::take(&mut stored.audit.add_who);

        *stored = instance.clone();
        stored.last_heartbeat = last_heartbeat;
        stored.register_time = register_time;
        stored.audit.add_time = add_time;
        stored.audit.add_who = add_who;
        stored.audit.active_flag = Flag::Y;
        stored.audit.version = expected_version + 1;
        Ok(stored.clone())
    }

    async fn deactivate_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        operator: &str,
    ) -> Result<Option<ServiceInstance>> {
        let mut instances = self.instances.write();
        match instances.get_mut(&instance_key(tenant_id, instance_id)) {
            Some(instance) if instance.audit.is_active() => {
                instance.audit.active_flag = Flag::N;
                instance.audit.touch(operator);
                instance.audit.version += 1;
                Ok(Some(instance.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn touch_heartbeat(
        &self,
        tenant_id: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<HeartbeatOutcome>> {
        let mut instances = self.instances.write();
        let Some(instance) = instances
            .get_mut(&instance_key(tenant_id, instance_id))
            .filter(|i| i.audit.is_active())
        else {
            return Ok(None);
        };

        instance.last_heartbeat = at;
        let restored = instance.health_status == HealthStatus::Unhealthy;
        if restored {
            instance.health_status = HealthStatus::Healthy;
            instance.audit.version += 1;
        }
        Ok(Some(HeartbeatOutcome {
            instance: instance.clone(),
            restored,
        }))
    }

    async fn list_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| {
                i.audit.is_active()
                    && i.tenant_id == key.tenant_id
                    && i.service_group_id == key.service_group_id
                    && i.service_name == key.service_name
            })
            .cloned()
            .collect())
    }

    async fn mark_stale_unhealthy(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>> {
        let mut instances = self.instances.write();
        let mut changed = Vec::new();
        for instance in instances.values_mut() {
            if instance.audit.is_active()
                && instance.health_status == HealthStatus::Healthy
                && instance.last_heartbeat < cutoff
            {
                instance.health_status = HealthStatus::Unhealthy;
                instance.audit.touch("health-sweeper");
                instance.audit.version += 1;
                changed.push(instance.clone());
            }
        }
        Ok(changed)
    }

    async fn expire_temp_instances(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>> {
        let mut instances = self.instances.write();
        let mut expired = Vec::new();
        for instance in instances.values_mut() {
            if instance.audit.is_active() && instance.is_temp() && instance.last_heartbeat < cutoff {
                instance.audit.active_flag = Flag::N;
                instance.audit.touch("health-sweeper");
                instance.audit.version += 1;
                expired.push(instance.clone());
            }
        }
        Ok(expired)
    }
}

#[derive(Debug, Default)]
struct EventLog {
    next_seq: i64,
    events: IndexMap<String, (i64, ClusterEvent)>,
}

/// Event store backed by process memory; sequences start at 1
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    log: RwLock<EventLog>,
    acks: RwLock<IndexMap<(String, String), ClusterEventAck>>,
}

impl MemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_event(&self, event: &ClusterEvent) -> Result<i64> {
        let mut log = self.log.write();
        if log.events.contains_key(&event.event_id) {
            return Err(Error::AlreadyExists(format!("event {}", event.event_id)));
        }
        log.next_seq += 1;
        let seq = log.next_seq;
        log.events
            .insert(event.event_id.clone(), (seq, event.clone()));
        Ok(seq)
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<ClusterEvent>> {
        Ok(self
            .log
            .read()
            .events
            .get(event_id)
            .map(|(_, event)| event.clone()))
    }

    async fn list_unacked_events(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredEvent>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let acks = self.acks.read();
        Ok(self
            .log
            .read()
            .events
            .values()
            .filter(|(_, e)| e.event_time >= since)
            .filter(|(_, e)| !acks.contains_key(&(e.event_id.clone(), node_id.to_string())))
            .take(limit)
            .map(|(_, e)| StoredEvent::Event(e.clone()))
            .collect())
    }

    async fn insert_ack(&self, ack: &ClusterEventAck) -> Result<bool> {
        let mut acks = self.acks.write();
        let key = (ack.event_id.clone(), ack.node_id.clone());
        if acks.contains_key(&key) {
            return Ok(false);
        }
        acks.insert(key, ack.clone());
        Ok(true)
    }

    async fn get_ack(&self, event_id: &str, node_id: &str) -> Result<Option<ClusterEventAck>> {
        Ok(self
            .acks
            .read()
            .get(&(event_id.to_string(), node_id.to_string()))
            .cloned())
    }

    async fn update_ack(
        &self,
        ack: &ClusterEventAck,
        expected_version: i64,
    ) -> Result<ClusterEventAck> {
        let mut acks = self.acks.write();
        let stored = acks
            .get_mut(&(ack.event_id.clone(), ack.node_id.clone()))
            .ok_or_else(|| Error::NotFound(format!("ack for event {}", ack.event_id)))?;
        if stored.audit.version != expected_version || stored.ack_status != AckStatus::Pending {
            return Err(Error::OptimisticLockConflict);
        }
        let add_time = stored.audit.add_time;
        *stored = ack.clone();
        stored.audit.add_time = add_time;
        stored.audit.version = expected_version + 1;
        Ok(stored.clone())
    }

    async fn list_pending_acks(
        &self,
        node_id: &str,
        after: Option<AckPosition>,
        limit: i64,
    ) -> Result<Vec<ClusterEventAck>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let acks = self.acks.read();
        let mut pending: Vec<&ClusterEventAck> = acks
            .values()
            .filter(|a| a.node_id == node_id && a.ack_status == AckStatus::Pending)
            .filter(|a| {
                after.as_ref().map_or(true, |pos| {
                    (a.audit.add_time, a.ack_id.as_str()) > (pos.add_time, pos.ack_id.as_str())
                })
            })
            .collect();
        pending.sort_by(|x, y| {
            (x.audit.add_time, &x.ack_id).cmp(&(y.audit.add_time, &y.ack_id))
        });
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed: Vec<String> = {
            let mut log = self.log.write();
            let ids: Vec<String> = log
                .events
                .values()
                .filter(|(_, e)| e.event_time < cutoff)
                .map(|(_, e)| e.event_id.clone())
                .collect();
            for id in &ids {
                log.events.shift_remove(id);
            }
            ids
        };
        if !removed.is_empty() {
            self.acks
                .write()
                .retain(|(event_id, _), _| !removed.contains(event_id));
        }
        Ok(removed.len() as u64)
    }
}
