use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::{audit_from_row, HeartbeatOutcome, RegistryStore, AUDIT_COLUMNS};
use crate::models::{HealthCheckPolicy, HealthStatus, Service, ServiceInstance, ServiceKey};
use crate::{Error, Result};

const SERVICE_COLUMNS: &str = "tenant_id, service_group_id, service_name, group_name, \
     protocol_type, context_path, health_check_url, health_check_interval, health_check_timeout, \
     health_check_type, health_check_mode, load_balance_strategy, metadata, tags";

const INSTANCE_COLUMNS: &str = "tenant_id, service_instance_id, service_group_id, service_name, \
     host_address, port_number, weight_value, client_id, client_version, client_type, \
     temp_instance_flag, instance_status, health_status, register_time, last_heartbeat, metadata";

/// Registry store on PostgreSQL.
///
/// Instance listing orders by the `seq` column, which keeps the first
/// insertion position across re-registrations.
#[derive(Clone, Debug)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_service(row: &PgRow) -> Result<Service> {
        let check_type: String = row.try_get("health_check_type")?;
        let check_mode: String = row.try_get("health_check_mode")?;
        let strategy: String = row.try_get("load_balance_strategy")?;

        Ok(Service {
            tenant_id: row.try_get("tenant_id")?,
            service_group_id: row.try_get("service_group_id")?,
            service_name: row.try_get("service_name")?,
            group_name: row.try_get("group_name")?,
            protocol_type: row.try_get("protocol_type")?,
            context_path: row.try_get("context_path")?,
            health_check: HealthCheckPolicy {
                url: row.try_get("health_check_url")?,
                interval_secs: row.try_get("health_check_interval")?,
                timeout_secs: row.try_get("health_check_timeout")?,
                check_type: check_type.parse()?,
                mode: check_mode.parse()?,
            },
            load_balance_strategy: strategy.parse()?,
            metadata: row.try_get("metadata")?,
            tags: row.try_get("tags")?,
            audit: audit_from_row(row)?,
        })
    }

    fn row_to_instance(row: &PgRow) -> Result<ServiceInstance> {
        let temp_flag: String = row.try_get("temp_instance_flag")?;
        let instance_status: String = row.try_get("instance_status")?;
        let health_status: String = row.try_get("health_status")?;

        Ok(ServiceInstance {
            tenant_id: row.try_get("tenant_id")?,
            service_instance_id: row.try_get("service_instance_id")?,
            service_group_id: row.try_get("service_group_id")?,
            service_name: row.try_get("service_name")?,
            host_address: row.try_get("host_address")?,
            port_number: row.try_get("port_number")?,
            weight_value: row.try_get("weight_value")?,
            client_id: row.try_get("client_id")?,
            client_version: row.try_get("client_version")?,
            client_type: row.try_get("client_type")?,
            temp_instance_flag: temp_flag.trim().parse()?,
            instance_status: instance_status.parse()?,
            health_status: health_status.parse()?,
            register_time: row.try_get("register_time")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            metadata: row.try_get("metadata")?,
            audit: audit_from_row(row)?,
        })
    }

    fn rows_to_instances(rows: &[PgRow]) -> Result<Vec<ServiceInstance>> {
        rows.iter().map(Self::row_to_instance).collect()
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn upsert_service(&self, service: &Service) -> Result<Service> {
        let sql = format!(
            "INSERT INTO services ({SERVICE_COLUMNS}, {AUDIT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     $15, $16, $17, $18, $19, 'Y', $20, $21, $22, $23, $24)
             ON CONFLICT (tenant_id, service_group_id, service_name) DO UPDATE SET
                group_name = EXCLUDED.group_name,
                protocol_type = EXCLUDED.protocol_type,
                context_path = EXCLUDED.context_path,
                health_check_url = EXCLUDED.health_check_url,
                health_check_interval = EXCLUDED.health_check_interval,
                health_check_timeout = EXCLUDED.health_check_timeout,
                health_check_type = EXCLUDED.health_check_type,
                health_check_mode = EXCLUDED.health_check_mode,
                load_balance_strategy = EXCLUDED.load_balance_strategy,
                metadata = EXCLUDED.metadata,
                tags = EXCLUDED.tags,
                edit_time = EXCLUDED.edit_time,
                edit_who = EXCLUDED.edit_who,
                version = services.version + 1,
                active_flag = 'Y',
                note_text = EXCLUDED.note_text,
                ext_property = EXCLUDED.ext_property
             RETURNING {SERVICE_COLUMNS}, {AUDIT_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&service.tenant_id)
            .bind(&service.service_group_id)
            .bind(&service.service_name)
            .bind(&service.group_name)
            .bind(&service.protocol_type)
            .bind(&service.context_path)
            .bind(&service.health_check.url)
            .bind(service.health_check.interval_secs)
            .bind(service.health_check.timeout_secs)
            .bind(service.health_check.check_type.as_str())
            .bind(service.health_check.mode.as_str())
            .bind(service.load_balance_strategy.as_str())
            .bind(&service.metadata)
            .bind(&service.tags)
            .bind(service.audit.add_time)
            .bind(&service.audit.add_who)
            .bind(service.audit.edit_time)
            .bind(&service.audit.edit_who)
            .bind(service.audit.version)
            .bind(&service.audit.note_text)
            .bind(&service.audit.ext_property)
            .bind(&service.audit.reserved1)
            .bind(&service.audit.reserved2)
            .bind(&service.audit.reserved3)
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_service(&row)
    }

    async fn get_service(&self, key: &ServiceKey) -> Result<Option<Service>> {
        let sql = format!(
            "SELECT {SERVICE_COLUMNS}, {AUDIT_COLUMNS}
             FROM services
             WHERE tenant_id = $1 AND service_group_id = $2 AND service_name = $3
               AND active_flag = 'Y'"
        );
        let row = sqlx::query(&sql)
            .bind(&key.tenant_id)
            .bind(&key.service_group_id)
            .bind(&key.service_name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_service).transpose()
    }

    async fn deactivate_service(&self, key: &ServiceKey, operator: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE services
             SET active_flag = 'N', edit_time = NOW(), edit_who = $4, version = version + 1
             WHERE tenant_id = $1 AND service_group_id = $2 AND service_name = $3
               AND active_flag = 'Y'",
        )
        .bind(&key.tenant_id)
        .bind(&key.service_group_id)
        .bind(&key.service_name)
        .bind(operator)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_instance(&self, instance: &ServiceInstance) -> Result<ServiceInstance> {
        let sql = format!(
            "INSERT INTO service_instances ({INSTANCE_COLUMNS}, {AUDIT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, 'Y', $22, $23, $24, $25, $26)
             ON CONFLICT (tenant_id, service_instance_id) DO UPDATE SET
                service_group_id = EXCLUDED.service_group_id,
                service_name = EXCLUDED.service_name,
                host_address = EXCLUDED.host_address,
                port_number = EXCLUDED.port_number,
                weight_value = EXCLUDED.weight_value,
                client_id = EXCLUDED.client_id,
                client_version = EXCLUDED.client_version,
                client_type = EXCLUDED.client_type,
                temp_instance_flag = EXCLUDED.temp_instance_flag,
                instance_status = EXCLUDED.instance_status,
                health_status = EXCLUDED.health_status,
                register_time = EXCLUDED.register_time,
                last_heartbeat = EXCLUDED.last_heartbeat,
                metadata = EXCLUDED.metadata,
                edit_time = EXCLUDED.edit_time,
                edit_who = EXCLUDED.edit_who,
                version = service_instances.version + 1,
                active_flag = 'Y'
             RETURNING {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&instance.tenant_id)
            .bind(&instance.service_instance_id)
            .bind(&instance.service_group_id)
            .bind(&instance.service_name)
            .bind(&instance.host_address)
            .bind(instance.port_number)
            .bind(instance.weight_value)
            .bind(&instance.client_id)
            .bind(&instance.client_version)
            .bind(&instance.client_type)
            .bind(instance.temp_instance_flag.as_str())
            .bind(instance.instance_status.as_str())
            .bind(instance.health_status.as_str())
            .bind(instance.register_time)
            .bind(instance.last_heartbeat)
            .bind(&instance.metadata)
            .bind(instance.audit.add_time)
            .bind(&instance.audit.add_who)
            .bind(instance.audit.edit_time)
            .bind(&instance.audit.edit_who)
            .bind(instance.audit.version)
            .bind(&instance.audit.note_text)
            .bind(&instance.audit.ext_property)
            .bind(&instance.audit.reserved1)
            .bind(&instance.audit.reserved2)
            .bind(&instance.audit.reserved3)
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_instance(&row)
    }

    async fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<Option<ServiceInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}
             FROM service_instances
             WHERE tenant_id = $1 AND service_instance_id = $2 AND active_flag = 'Y'"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn update_instance(
        &self,
        instance: &ServiceInstance,
        expected_version: i64,
    ) -> Result<ServiceInstance> {
        let sql = format!(
            "UPDATE service_instances
             SET host_address = $3,
                 port_number = $4,
                 weight_value = $5,
                 client_version = $6,
                 instance_status = $7,
                 health_status = $8,
                 metadata = $9,
                 edit_time = $10,
                 edit_who = $11,
                 version = version + 1
             WHERE tenant_id = $1 AND service_instance_id = $2
               AND active_flag = 'Y' AND version = $12
             RETURNING {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&instance.tenant_id)
            .bind(&instance.service_instance_id)
            .bind(&instance.host_address)
            .bind(instance.port_number)
            .bind(instance.weight_value)
            .bind(&instance.client_version)
            .bind(instance.instance_status.as_str())
            .bind(instance.health_status.as_str())
            .bind(&instance.metadata)
            .bind(instance.audit.edit_time)
            .bind(&instance.audit.edit_who)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_instance(&row),
            // Distinguish a moved version from a missing row
            None => match self
                .get_instance(&instance.tenant_id, &instance.service_instance_id)
                .await?
            {
                Some(_) => Err(Error::OptimisticLockConflict),
                None => Err(Error::NotFound(format!(
                    "instance {}",
                    instance.service_instance_id
                ))),
            },
        }
    }

    async fn deactivate_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
        operator: &str,
    ) -> Result<Option<ServiceInstance>> {
        let sql = format!(
            "UPDATE service_instances
             SET active_flag = 'N', edit_time = NOW(), edit_who = $3, version = version + 1
             WHERE tenant_id = $1 AND service_instance_id = $2 AND active_flag = 'Y'
             RETURNING {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(instance_id)
            .bind(operator)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn touch_heartbeat(
        &self,
        tenant_id: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<HeartbeatOutcome>> {
        // The CTE captures the health status before the write
        let sql = format!(
            "WITH prev AS (
                SELECT health_status AS prev_health
                FROM service_instances
                WHERE tenant_id = $1 AND service_instance_id = $2 AND active_flag = 'Y'
                FOR UPDATE
             )
             UPDATE service_instances
             SET last_heartbeat = $3,
                 health_status = CASE WHEN prev.prev_health = 'UNHEALTHY'
                                      THEN 'HEALTHY' ELSE health_status END,
                 version = CASE WHEN prev.prev_health = 'UNHEALTHY'
                                THEN version + 1 ELSE version END
             FROM prev
             WHERE tenant_id = $1 AND service_instance_id = $2 AND active_flag = 'Y'
             RETURNING {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}, prev.prev_health"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(instance_id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let prev_health: String = row.try_get("prev_health")?;
        Ok(Some(HeartbeatOutcome {
            instance: Self::row_to_instance(&row)?,
            restored: prev_health == HealthStatus::Unhealthy.as_str(),
        }))
    }

    async fn list_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}
             FROM service_instances
             WHERE tenant_id = $1 AND service_group_id = $2 AND service_name = $3
               AND active_flag = 'Y'
             ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(&key.tenant_id)
            .bind(&key.service_group_id)
            .bind(&key.service_name)
            .fetch_all(&self.pool)
            .await?;

        Self::rows_to_instances(&rows)
    }

    async fn mark_stale_unhealthy(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>> {
        let sql = format!(
            "UPDATE service_instances
             SET health_status = 'UNHEALTHY', edit_time = NOW(), edit_who = 'health-sweeper',
                 version = version + 1
             WHERE active_flag = 'Y' AND health_status = 'HEALTHY' AND last_heartbeat < $1
             RETURNING {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}"
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;

        Self::rows_to_instances(&rows)
    }

    async fn expire_temp_instances(&self, cutoff: DateTime<Utc>) -> Result<Vec<ServiceInstance>> {
        let sql = format!(
            "UPDATE service_instances
             SET active_flag = 'N', edit_time = NOW(), edit_who = 'health-sweeper',
                 version = version + 1
             WHERE active_flag = 'Y' AND temp_instance_flag = 'Y' AND last_heartbeat < $1
             RETURNING {INSTANCE_COLUMNS}, {AUDIT_COLUMNS}"
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;

        Self::rows_to_instances(&rows)
    }
}
