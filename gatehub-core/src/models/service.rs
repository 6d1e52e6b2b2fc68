use serde::{Deserialize, Serialize};

use super::audit::AuditFields;
use super::id::ServiceKey;

/// Group name used when a service does not declare one
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Algorithm used to pick one instance among the eligible set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalanceStrategy {
    /// Draw proportional to weight (default)
    #[default]
    WeightedRandom,
    /// Smooth weighted round robin
    WeightedRoundRobin,
    RoundRobin,
    Random,
}

text_enum!(LoadBalanceStrategy, "load balance strategy", {
    WeightedRandom => "WEIGHTED_RANDOM",
    WeightedRoundRobin => "WEIGHTED_ROUND_ROBIN",
    RoundRobin => "ROUND_ROBIN",
    Random => "RANDOM",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckType {
    #[default]
    Heartbeat,
    Http,
    Tcp,
    None,
}

text_enum!(HealthCheckType, "health check type", {
    Heartbeat => "HEARTBEAT",
    Http => "HTTP",
    Tcp => "TCP",
    None => "NONE",
});

/// Who drives liveness: the client (heartbeats) or the server (probes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckMode {
    #[default]
    ClientReport,
    ServerProbe,
}

text_enum!(HealthCheckMode, "health check mode", {
    ClientReport => "CLIENT_REPORT",
    ServerProbe => "SERVER_PROBE",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckPolicy {
    pub url: Option<String>,
    pub interval_secs: i32,
    pub timeout_secs: i32,
    pub check_type: HealthCheckType,
    pub mode: HealthCheckMode,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            url: None,
            interval_secs: 5,
            timeout_secs: 15,
            check_type: HealthCheckType::default(),
            mode: HealthCheckMode::default(),
        }
    }
}

/// Logical named endpoint group within a tenant/service-group scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub tenant_id: String,
    pub service_group_id: String,
    pub service_name: String,
    pub group_name: String,
    pub protocol_type: String,
    pub context_path: Option<String>,
    pub health_check: HealthCheckPolicy,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub metadata: Option<serde_json::Value>,
    pub tags: Option<serde_json::Value>,
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl Service {
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(
            &self.tenant_id,
            &self.service_group_id,
            &self.service_name,
        )
    }
}

/// Input for `RegisterService`; unset fields take defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceRegistration {
    pub tenant_id: String,
    pub service_group_id: String,
    pub service_name: String,
    pub group_name: Option<String>,
    pub protocol_type: Option<String>,
    pub context_path: Option<String>,
    pub health_check: Option<HealthCheckPolicy>,
    pub load_balance_strategy: Option<LoadBalanceStrategy>,
    pub metadata: Option<serde_json::Value>,
    pub tags: Option<serde_json::Value>,
    pub operator: Option<String>,
}

impl ServiceRegistration {
    pub fn new(
        tenant_id: impl Into<String>,
        service_group_id: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            service_group_id: service_group_id.into(),
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.load_balance_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    /// Materialize into a fresh `Service` row
    #[must_use]
    pub fn into_service(self) -> Service {
        let operator = self.operator.unwrap_or_else(|| "system".to_string());
        Service {
            tenant_id: self.tenant_id,
            service_group_id: self.service_group_id,
            service_name: self.service_name,
            group_name: self
                .group_name
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            protocol_type: self.protocol_type.unwrap_or_else(|| "HTTP".to_string()),
            context_path: self.context_path,
            health_check: self.health_check.unwrap_or_default(),
            load_balance_strategy: self.load_balance_strategy.unwrap_or_default(),
            metadata: self.metadata,
            tags: self.tags,
            audit: AuditFields::new(operator),
        }
    }
}
