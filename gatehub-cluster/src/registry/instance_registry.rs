use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gatehub_core::{
    config::RegistryConfig,
    models::{
        HealthStatus, InstanceRegistration, InstanceStatus, InstanceUpdate, Service,
        ServiceInstance, ServiceKey, ServiceRegistration, DEFAULT_GROUP,
    },
    repository::{HeartbeatOutcome, RegistryStore},
    Error, ErrorCode, Result,
};
use moka::future::Cache;
use tracing::{debug, info};

use super::load_balancer::LoadBalancer;

/// Service and instance bookkeeping plus discovery.
///
/// The store is the authority. Service metadata is read through a short-lived
/// cache that every service write invalidates.
pub struct InstanceRegistry {
    store: Arc<dyn RegistryStore>,
    services: Cache<ServiceKey, Service>,
    balancer: LoadBalancer,
    default_weight: i32,
}

impl InstanceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, config: &RegistryConfig) -> Self {
        let services = Cache::builder()
            .max_capacity(config.service_cache_capacity)
            .time_to_live(Duration::from_secs(config.service_cache_ttl_secs))
            .build();

        Self {
            store,
            services,
            balancer: LoadBalancer::new(),
            default_weight: config.default_weight,
        }
    }

    /// Upsert a service keyed by (tenant, group, name)
    pub async fn register_service(&self, registration: ServiceRegistration) -> Result<Service> {
        validate_scope(&registration.tenant_id, &registration.service_group_id)?;
        require_service_name(&registration.service_name)?;

        let stored = self.store.upsert_service(&registration.into_service()).await?;
        let key = stored.key();
        self.services.insert(key.clone(), stored.clone()).await;

        info!(service = %key, strategy = %stored.load_balance_strategy, "Service registered");
        Ok(stored)
    }

    /// Logically delete a service
    pub async fn deregister_service(
        &self,
        tenant_id: &str,
        group_id: &str,
        service_name: &str,
        operator: &str,
    ) -> Result<()> {
        validate_scope(tenant_id, group_id)?;
        require_service_name(service_name)?;

        let key = ServiceKey::new(tenant_id, group_id, service_name);
        let removed = self.store.deactivate_service(&key, operator).await?;
        self.services.invalidate(&key).await;
        self.balancer.forget(&key);

        if !removed {
            return Err(Error::NotFound(format!("service {key}")));
        }
        info!(service = %key, "Service deregistered");
        Ok(())
    }

    /// Validate, fill defaults and store an instance.
    ///
    /// The owning service is created with defaults if it does not exist yet.
    pub async fn register_instance(
        &self,
        registration: InstanceRegistration,
    ) -> Result<ServiceInstance> {
        registration.validate()?;

        let key = ServiceKey::new(
            &registration.tenant_id,
            &registration.service_group_id,
            &registration.service_name,
        );
        if self.service(&key).await?.is_none() {
            let mut implicit = ServiceRegistration::new(
                &key.tenant_id,
                &key.service_group_id,
                &key.service_name,
            );
            implicit.operator.clone_from(&registration.operator);
            self.register_service(implicit).await?;
        }

        let instance = registration.into_instance(self.default_weight);
        let stored = self.store.upsert_instance(&instance).await?;

        info!(
            service = %key,
            instance_id = %stored.service_instance_id,
            address = %format!("{}:{}", stored.host_address, stored.port_number),
            weight = stored.weight_value,
            "Instance registered"
        );
        Ok(stored)
    }

    /// Partial update with optimistic concurrency.
    ///
    /// Without an explicit `expected_version` the version read here is used,
    /// so a concurrent writer still surfaces as a conflict.
    pub async fn update_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        update: InstanceUpdate,
    ) -> Result<ServiceInstance> {
        require_instance_id(instance_id)?;
        update.validate()?;

        let current = self
            .store
            .get_instance(tenant_id, instance_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))?;

        let expected_version = update.expected_version.unwrap_or(current.audit.version);
        let mut edited = current;
        update.apply_to(&mut edited);

        let stored = self.store.update_instance(&edited, expected_version).await?;
        debug!(
            instance_id = %instance_id,
            version = stored.audit.version,
            status = %stored.instance_status,
            health = %stored.health_status,
            "Instance updated"
        );
        Ok(stored)
    }

    /// Remove an instance from the active set
    pub async fn deregister_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        operator: &str,
    ) -> Result<ServiceInstance> {
        require_instance_id(instance_id)?;

        let removed = self
            .store
            .deactivate_instance(tenant_id, instance_id, operator)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))?;

        info!(service = %removed.key(), instance_id = %instance_id, "Instance deregistered");
        Ok(removed)
    }

    /// Renew the heartbeat; unknown instances are reported as not found so
    /// clients know to re-register
    pub async fn heartbeat(&self, tenant_id: &str, instance_id: &str) -> Result<HeartbeatOutcome> {
        require_instance_id(instance_id)?;

        let outcome = self
            .store
            .touch_heartbeat(tenant_id, instance_id, Utc::now())
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))?;

        if outcome.restored {
            info!(instance_id = %instance_id, "Heartbeat restored instance to HEALTHY");
        }
        Ok(outcome)
    }

    pub async fn update_instance_status(
        &self,
        tenant_id: &str,
        instance_id: &str,
        instance_status: InstanceStatus,
        health_status: Option<HealthStatus>,
        weight: Option<i32>,
    ) -> Result<ServiceInstance> {
        self.update_instance(
            tenant_id,
            instance_id,
            InstanceUpdate::status(instance_status, health_status, weight),
        )
        .await
    }

    /// All active instances of a service, any status
    pub async fn list_instances(
        &self,
        tenant_id: &str,
        group_id: &str,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>> {
        validate_scope(tenant_id, group_id)?;
        require_service_name(service_name)?;

        let key = ServiceKey::new(tenant_id, group_id, service_name);
        let instances = self.store.list_instances(&key).await?;
        if instances.is_empty() && self.service(&key).await?.is_none() {
            return Err(Error::NotFound(format!("service {key}")));
        }
        Ok(instances)
    }

    /// Eligible (UP, HEALTHY, active) instances of a service
    pub async fn eligible_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>> {
        let mut instances = self.store.list_instances(key).await?;
        instances.retain(ServiceInstance::is_eligible);
        Ok(instances)
    }

    /// Pick one eligible instance with the service's strategy
    pub async fn discover_instance(
        &self,
        tenant_id: &str,
        group_id: &str,
        service_name: &str,
    ) -> Result<ServiceInstance> {
        validate_scope(tenant_id, group_id)?;
        require_service_name(service_name)?;

        let key = ServiceKey::new(tenant_id, group_id, service_name);
        let strategy = self
            .service(&key)
            .await?
            .map(|s| s.load_balance_strategy)
            .unwrap_or_default();

        let eligible = self.eligible_instances(&key).await?;
        let chosen = self
            .balancer
            .select(&key, strategy, &eligible)
            .cloned()
            .ok_or_else(|| Error::NoAvailableInstance(key.to_string()))?;

        debug!(
            service = %key,
            strategy = %strategy,
            candidates = eligible.len(),
            instance_id = %chosen.service_instance_id,
            "Instance discovered"
        );
        Ok(chosen)
    }

    /// Service metadata; an empty `group_name` matches any group
    pub async fn discover_service(
        &self,
        tenant_id: &str,
        group_id: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<Service> {
        validate_scope(tenant_id, group_id)?;
        require_service_name(service_name)?;

        let key = ServiceKey::new(tenant_id, group_id, service_name);
        self.service(&key)
            .await?
            .filter(|s| group_name.is_empty() || s.group_name == group_name)
            .ok_or_else(|| Error::NotFound(format!("service {key}")))
    }

    /// Group name used for push targeting
    pub async fn group_name_of(&self, key: &ServiceKey) -> String {
        match self.service(key).await {
            Ok(Some(service)) => service.group_name,
            _ => DEFAULT_GROUP.to_string(),
        }
    }

    /// Flip instances with stale heartbeats to UNHEALTHY
    pub async fn mark_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>> {
        self.store.mark_stale_unhealthy(cutoff).await
    }

    /// Deregister temp instances with stale heartbeats
    pub async fn expire_temp(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>> {
        self.store.expire_temp_instances(cutoff).await
    }

    async fn service(&self, key: &ServiceKey) -> Result<Option<Service>> {
        if let Some(service) = self.services.get(key).await {
            return Ok(Some(service));
        }
        let loaded = self.store.get_service(key).await?;
        if let Some(service) = &loaded {
            self.services.insert(key.clone(), service.clone()).await;
        }
        Ok(loaded)
    }
}

fn validate_scope(tenant_id: &str, group_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(Error::validation(ErrorCode::MissingTenantId, "tenantId is required"));
    }
    if group_id.trim().is_empty() {
        return Err(Error::validation(
            ErrorCode::MissingServiceGroupId,
            "serviceGroupId is required",
        ));
    }
    Ok(())
}

fn require_service_name(service_name: &str) -> Result<()> {
    if service_name.trim().is_empty() {
        return Err(Error::validation(
            ErrorCode::MissingServiceName,
            "serviceName is required",
        ));
    }
    Ok(())
}

fn require_instance_id(instance_id: &str) -> Result<()> {
    if instance_id.trim().is_empty() {
        return Err(Error::validation(
            ErrorCode::MissingServiceInstanceId,
            "serviceInstanceId is required",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehub_core::models::LoadBalanceStrategy;
    use gatehub_core::repository::MemoryRegistryStore;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(Arc::new(MemoryRegistryStore::new()), &RegistryConfig::default())
    }

    fn reg(id: &str, host: &str) -> InstanceRegistration {
        InstanceRegistration::new("t1", "g1", "orders", id, host, 8080)
    }

    #[tokio::test]
    async fn test_register_then_list_round_trip() {
        let registry = registry();
        let mut registration = reg("orders-1", "10.0.0.1").with_weight(40);
        registration.client_version = Some("1.2.0".to_string());
        registry.register_instance(registration).await.unwrap();

        let listed = registry.list_instances("t1", "g1", "orders").await.unwrap();
        assert_eq!(listed.len(), 1);
        let instance = &listed[0];
        assert_eq!(instance.host_address, "10.0.0.1");
        assert_eq!(instance.port_number, 8080);
        assert_eq!(instance.weight_value, 40);
        assert_eq!(instance.client_version.as_deref(), Some("1.2.0"));
        assert_eq!(instance.instance_status, InstanceStatus::Up);
        assert_eq!(instance.health_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_register_instance_creates_service() {
        let registry = registry();
        registry.register_instance(reg("orders-1", "10.0.0.1")).await.unwrap();
        let service = registry
            .discover_service("t1", "g1", "", "orders")
            .await
            .unwrap();
        assert_eq!(service.group_name, DEFAULT_GROUP);
    }

    #[tokio::test]
    async fn test_invalid_registration_writes_nothing() {
        let registry = registry();
        let mut bad = reg("orders-1", "10.0.0.1");
        bad.port_number = 70000;
        let err = registry.register_instance(bad).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidPortNumber));
        assert!(registry.list_instances("t1", "g1", "orders").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_register_service_requires_name() {
        let registry = registry();
        let err = registry
            .register_service(ServiceRegistration::new("t1", "g1", ""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MissingServiceName));
    }

    #[tokio::test]
    async fn test_discover_only_returns_eligible() {
        let registry = registry();
        registry.register_instance(reg("up", "10.0.0.1")).await.unwrap();
        registry.register_instance(reg("down", "10.0.0.2")).await.unwrap();
        registry.register_instance(reg("sick", "10.0.0.3")).await.unwrap();
        registry
            .update_instance_status("t1", "down", InstanceStatus::Down, None, None)
            .await
            .unwrap();
        registry
            .update_instance_status("t1", "sick", InstanceStatus::Up, Some(HealthStatus::Unhealthy), None)
            .await
            .unwrap();

        for _ in 0..200 {
            let chosen = registry.discover_instance("t1", "g1", "orders").await.unwrap();
            assert_eq!(chosen.service_instance_id, "up");
        }
    }

    #[tokio::test]
    async fn test_zero_weight_scenario() {
        let registry = registry();
        registry
            .register_instance(reg("a", "10.0.0.1").with_weight(100))
            .await
            .unwrap();
        registry
            .register_instance(reg("b", "10.0.0.2").with_weight(0))
            .await
            .unwrap();

        for _ in 0..500 {
            let chosen = registry.discover_instance("t1", "g1", "orders").await.unwrap();
            assert_eq!(chosen.host_address, "10.0.0.1");
        }
    }

    #[tokio::test]
    async fn test_discover_without_eligible_instances() {
        let registry = registry();
        let err = registry.discover_instance("t1", "g1", "orders").await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstance(_)));

        registry.register_instance(reg("a", "10.0.0.1")).await.unwrap();
        registry.deregister_instance("t1", "a", "admin").await.unwrap();
        let err = registry.discover_instance("t1", "g1", "orders").await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstance(_)));
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_not_found() {
        let registry = registry();
        assert!(registry
            .deregister_instance("t1", "ghost", "admin")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(registry
            .deregister_service("t1", "g1", "ghost", "admin")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_and_restore() {
        let registry = registry();
        assert!(registry.heartbeat("t1", "ghost").await.unwrap_err().is_not_found());

        registry.register_instance(reg("a", "10.0.0.1")).await.unwrap();
        registry
            .update_instance_status("t1", "a", InstanceStatus::Up, Some(HealthStatus::Unhealthy), None)
            .await
            .unwrap();
        let outcome = registry.heartbeat("t1", "a").await.unwrap();
        assert!(outcome.restored);
        assert!(registry.discover_instance("t1", "g1", "orders").await.is_ok());
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let registry = registry();
        let stored = registry.register_instance(reg("a", "10.0.0.1")).await.unwrap();

        let first = InstanceUpdate {
            weight_value: Some(10),
            expected_version: Some(stored.audit.version),
            ..Default::default()
        };
        registry.update_instance("t1", "a", first.clone()).await.unwrap();

        let err = registry.update_instance("t1", "a", first).await.unwrap_err();
        assert!(matches!(err, Error::OptimisticLockConflict));
    }

    #[tokio::test]
    async fn test_discover_service_group_name_filter() {
        let registry = registry();
        registry
            .register_service(
                ServiceRegistration::new("t1", "g1", "payments")
                    .with_group_name("BILLING")
                    .with_strategy(LoadBalanceStrategy::RoundRobin),
            )
            .await
            .unwrap();

        let service = registry
            .discover_service("t1", "g1", "BILLING", "payments")
            .await
            .unwrap();
        assert_eq!(service.load_balance_strategy, LoadBalanceStrategy::RoundRobin);
        assert!(registry
            .discover_service("t1", "g1", "OTHER", "payments")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_deregister_service_invalidates_cache() {
        let registry = registry();
        registry
            .register_service(ServiceRegistration::new("t1", "g1", "orders"))
            .await
            .unwrap();
        registry.discover_service("t1", "g1", "", "orders").await.unwrap();
        registry
            .deregister_service("t1", "g1", "orders", "admin")
            .await
            .unwrap();
        assert!(registry
            .discover_service("t1", "g1", "", "orders")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
