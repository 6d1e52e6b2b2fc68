use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audit::{AuditFields, Flag};
use super::id::ServiceKey;
use crate::error::{Error, ErrorCode, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    #[default]
    Up,
    Down,
    OutOfService,
}

text_enum!(InstanceStatus, "instance status", {
    Starting => "STARTING",
    Up => "UP",
    Down => "DOWN",
    OutOfService => "OUT_OF_SERVICE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
    Unknown,
}

text_enum!(HealthStatus, "health status", {
    Healthy => "HEALTHY",
    Unhealthy => "UNHEALTHY",
    Unknown => "UNKNOWN",
});

/// One concrete network-addressable process backing a Service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub tenant_id: String,
    pub service_instance_id: String,
    pub service_group_id: String,
    pub service_name: String,
    pub host_address: String,
    pub port_number: i32,
    pub weight_value: i32,
    pub client_id: Option<String>,
    pub client_version: Option<String>,
    pub client_type: Option<String>,
    pub temp_instance_flag: Flag,
    pub instance_status: InstanceStatus,
    pub health_status: HealthStatus,
    pub register_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl ServiceInstance {
    /// Visible to discovery: UP, HEALTHY and active
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.instance_status == InstanceStatus::Up
            && self.health_status == HealthStatus::Healthy
            && self.audit.is_active()
    }

    #[must_use]
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(
            &self.tenant_id,
            &self.service_group_id,
            &self.service_name,
        )
    }

    #[must_use]
    pub const fn is_temp(&self) -> bool {
        self.temp_instance_flag.is_set()
    }
}

/// Input for `RegisterInstance`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceRegistration {
    pub tenant_id: String,
    pub service_group_id: String,
    pub service_name: String,
    pub service_instance_id: String,
    pub host_address: String,
    pub port_number: i32,
    pub weight_value: Option<i32>,
    pub client_id: Option<String>,
    pub client_version: Option<String>,
    pub client_type: Option<String>,
    pub temp_instance: Option<bool>,
    pub instance_status: Option<InstanceStatus>,
    pub health_status: Option<HealthStatus>,
    pub metadata: Option<serde_json::Value>,
    pub operator: Option<String>,
}

impl InstanceRegistration {
    pub fn new(
        tenant_id: impl Into<String>,
        service_group_id: impl Into<String>,
        service_name: impl Into<String>,
        service_instance_id: impl Into<String>,
        host_address: impl Into<String>,
        port_number: i32,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            service_group_id: service_group_id.into(),
            service_name: service_name.into(),
            service_instance_id: service_instance_id.into(),
            host_address: host_address.into(),
            port_number,
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_weight(mut self, weight: i32) -> Self {
        self.weight_value = Some(weight);
        self
    }

    #[must_use]
    pub const fn temporary(mut self) -> Self {
        self.temp_instance = Some(true);
        self
    }

    /// Check required fields; nothing is written when this fails
    pub fn validate(&self) -> Result<()> {
        require(&self.tenant_id, ErrorCode::MissingTenantId, "tenantId")?;
        require(
            &self.service_group_id,
            ErrorCode::MissingServiceGroupId,
            "serviceGroupId",
        )?;
        require(&self.service_name, ErrorCode::MissingServiceName, "serviceName")?;
        require(
            &self.service_instance_id,
            ErrorCode::MissingServiceInstanceId,
            "serviceInstanceId",
        )?;
        require(&self.host_address, ErrorCode::MissingHostAddress, "hostAddress")?;
        validate_port(self.port_number)?;
        if let Some(weight) = self.weight_value {
            validate_weight(weight)?;
        }
        Ok(())
    }

    /// Build the stored row, filling server-assigned defaults
    #[must_use]
    pub fn into_instance(self, default_weight: i32) -> ServiceInstance {
        let now = Utc::now();
        let operator = self.operator.unwrap_or_else(|| "system".to_string());
        ServiceInstance {
            tenant_id: self.tenant_id,
            service_instance_id: self.service_instance_id,
            service_group_id: self.service_group_id,
            service_name: self.service_name,
            host_address: self.host_address,
            port_number: self.port_number,
            weight_value: self.weight_value.unwrap_or(default_weight),
            client_id: self.client_id,
            client_version: self.client_version,
            client_type: self.client_type,
            temp_instance_flag: Flag::from(self.temp_instance.unwrap_or(false)),
            instance_status: self.instance_status.unwrap_or_default(),
            health_status: self.health_status.unwrap_or_default(),
            register_time: now,
            last_heartbeat: now,
            metadata: self.metadata,
            audit: AuditFields::new(operator),
        }
    }
}

/// Partial update for `UpdateInstance` / `UpdateInstanceStatus`
///
/// `expected_version` is the version the caller last read; when set, the
/// write is rejected with a conflict if the stored row has moved on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceUpdate {
    pub host_address: Option<String>,
    pub port_number: Option<i32>,
    pub weight_value: Option<i32>,
    pub instance_status: Option<InstanceStatus>,
    pub health_status: Option<HealthStatus>,
    pub client_version: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expected_version: Option<i64>,
    pub operator: Option<String>,
}

impl InstanceUpdate {
    #[must_use]
    pub fn status(
        instance_status: InstanceStatus,
        health_status: Option<HealthStatus>,
        weight_value: Option<i32>,
    ) -> Self {
        Self {
            instance_status: Some(instance_status),
            health_status,
            weight_value,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(host) = &self.host_address {
            require(host, ErrorCode::MissingHostAddress, "hostAddress")?;
        }
        if let Some(port) = self.port_number {
            validate_port(port)?;
        }
        if let Some(weight) = self.weight_value {
            validate_weight(weight)?;
        }
        Ok(())
    }

    /// Apply the set fields and bump edit metadata
    pub fn apply_to(&self, instance: &mut ServiceInstance) {
        if let Some(host) = &self.host_address {
            instance.host_address.clone_from(host);
        }
        if let Some(port) = self.port_number {
            instance.port_number = port;
        }
        if let Some(weight) = self.weight_value {
            instance.weight_value = weight;
        }
        if let Some(status) = self.instance_status {
            instance.instance_status = status;
        }
        if let Some(health) = self.health_status {
            instance.health_status = health;
        }
        if let Some(version) = &self.client_version {
            instance.client_version = Some(version.clone());
        }
        if let Some(metadata) = &self.metadata {
            instance.metadata = Some(metadata.clone());
        }
        instance
            .audit
            .touch(self.operator.as_deref().unwrap_or("system"));
    }
}

fn require(value: &str, code: ErrorCode, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(code, format!("{field} is required")));
    }
    Ok(())
}

fn validate_port(port: i32) -> Result<()> {
    if port <= 0 || port > 65535 {
        return Err(Error::validation(
            ErrorCode::InvalidPortNumber,
            format!("portNumber must be in (0, 65535], got {port}"),
        ));
    }
    Ok(())
}

fn validate_weight(weight: i32) -> Result<()> {
    if weight < 0 {
        return Err(Error::validation(
            ErrorCode::InvalidWeight,
            format!("weightValue must not be negative, got {weight}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> InstanceRegistration {
        InstanceRegistration::new("t1", "g1", "orders", "orders-1", "10.0.0.1", 8080)
    }

    #[test]
    fn test_status_text_round_trip() {
        assert_eq!("OUT_OF_SERVICE".parse::<InstanceStatus>().unwrap(), InstanceStatus::OutOfService);
        assert_eq!("UNHEALTHY".parse::<HealthStatus>().unwrap(), HealthStatus::Unhealthy);
        assert_eq!(InstanceStatus::Down.to_string(), "DOWN");
        assert!("SLEEPING".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_validate_accepts_complete_registration() {
        assert!(registration().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let mut reg = registration();
        reg.service_name = String::new();
        assert_eq!(
            reg.validate().unwrap_err().code(),
            Some(ErrorCode::MissingServiceName)
        );

        let mut reg = registration();
        reg.service_instance_id = "  ".to_string();
        assert_eq!(
            reg.validate().unwrap_err().code(),
            Some(ErrorCode::MissingServiceInstanceId)
        );

        let mut reg = registration();
        reg.host_address = String::new();
        assert_eq!(
            reg.validate().unwrap_err().code(),
            Some(ErrorCode::MissingHostAddress)
        );
    }

    #[test]
    fn test_port_bounds() {
        for port in [0, -1, 65536] {
            let mut reg = registration();
            reg.port_number = port;
            assert_eq!(
                reg.validate().unwrap_err().code(),
                Some(ErrorCode::InvalidPortNumber)
            );
        }
        let mut reg = registration();
        reg.port_number = 65535;
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn test_into_instance_assigns_defaults() {
        let instance = registration().into_instance(100);
        assert_eq!(instance.weight_value, 100);
        assert_eq!(instance.instance_status, InstanceStatus::Up);
        assert_eq!(instance.health_status, HealthStatus::Healthy);
        assert_eq!(instance.temp_instance_flag, Flag::N);
        assert!(instance.is_eligible());

        let zero = registration().with_weight(0).into_instance(100);
        assert_eq!(zero.weight_value, 0);
    }

    #[test]
    fn test_eligibility_requires_up_healthy_active() {
        let mut instance = registration().into_instance(100);
        instance.health_status = HealthStatus::Unhealthy;
        assert!(!instance.is_eligible());

        let mut instance = registration().into_instance(100);
        instance.instance_status = InstanceStatus::Down;
        assert!(!instance.is_eligible());

        let mut instance = registration().into_instance(100);
        instance.audit.active_flag = Flag::N;
        assert!(!instance.is_eligible());
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let mut instance = registration().into_instance(100);
        let update = InstanceUpdate::status(InstanceStatus::OutOfService, None, Some(5));
        update.validate().unwrap();
        update.apply_to(&mut instance);
        assert_eq!(instance.instance_status, InstanceStatus::OutOfService);
        assert_eq!(instance.health_status, HealthStatus::Healthy);
        assert_eq!(instance.weight_value, 5);
        assert_eq!(instance.host_address, "10.0.0.1");
    }

    #[test]
    fn test_update_rejects_negative_weight() {
        let update = InstanceUpdate::status(InstanceStatus::Up, None, Some(-3));
        assert_eq!(update.validate().unwrap_err().code(), Some(ErrorCode::InvalidWeight));
    }
}
