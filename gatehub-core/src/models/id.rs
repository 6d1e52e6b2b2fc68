use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 16-character nanoid for server-assigned identifiers
#[must_use]
pub fn generate_id() -> String {
    nanoid!(16)
}

/// Identity of a Service: (tenant, service group, service name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceKey {
    pub tenant_id: String,
    pub service_group_id: String,
    pub service_name: String,
}

impl ServiceKey {
    pub fn new(
        tenant_id: impl Into<String>,
        service_group_id: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            service_group_id: service_group_id.into(),
            service_name: service_name.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id, self.service_group_id, self.service_name
        )
    }
}
