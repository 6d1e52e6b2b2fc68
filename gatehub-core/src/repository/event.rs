use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::{audit_from_row, AckPosition, EventStore, StoredEvent, AUDIT_COLUMNS};
use crate::models::{ClusterEvent, ClusterEventAck, EventAction, EventType};
use crate::{Error, Result};

const EVENT_COLUMNS: &str = "event_id, tenant_id, source_node_id, source_node_ip, event_type, \
     event_action, event_payload, event_time, expire_time";

const ACK_COLUMNS: &str = "ack_id, tenant_id, event_id, node_id, node_ip, ack_status, \
     process_time, result_message, retry_count";

/// Cluster event and ack persistence on PostgreSQL
#[derive(Clone, Debug)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &PgRow) -> Result<ClusterEvent> {
        let event_type: String = row.try_get("event_type")?;
        let event_action: String = row.try_get("event_action")?;
        let payload: String = row.try_get("event_payload")?;
        let (event_type, event_action, event_payload) =
            decode_event_body(&event_type, &event_action, &payload)?;

        Ok(ClusterEvent {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            source_node_id: row.try_get("source_node_id")?,
            source_node_ip: row.try_get("source_node_ip")?,
            event_type,
            event_action,
            event_payload,
            event_time: row.try_get("event_time")?,
            expire_time: row.try_get("expire_time")?,
            audit: audit_from_row(row)?,
        })
    }

    /// Decode one log row, degrading to `Undecodable` when only the identity
    /// columns can be read
    fn row_to_stored_event(row: &PgRow) -> Result<StoredEvent> {
        match Self::row_to_event(row) {
            Ok(event) => Ok(StoredEvent::Event(event)),
            Err(e) => Ok(StoredEvent::Undecodable {
                event_id: row.try_get("event_id")?,
                tenant_id: row.try_get("tenant_id")?,
                reason: e.to_string(),
            }),
        }
    }

    fn row_to_ack(row: &PgRow) -> Result<ClusterEventAck> {
        let status: String = row.try_get("ack_status")?;

        Ok(ClusterEventAck {
            ack_id: row.try_get("ack_id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_id: row.try_get("event_id")?,
            node_id: row.try_get("node_id")?,
            node_ip: row.try_get("node_ip")?,
            ack_status: status.parse()?,
            process_time: row.try_get("process_time")?,
            result_message: row.try_get("result_message")?,
            retry_count: row.try_get("retry_count")?,
            audit: audit_from_row(row)?,
        })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_event(&self, event: &ClusterEvent) -> Result<i64> {
        let payload = serde_json::to_string(&event.event_payload)?;
        let sql = format!(
            "INSERT INTO cluster_events ({EVENT_COLUMNS}, {AUDIT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1, 'Y',
                     $14, $15, $16, $17, $18)
             RETURNING seq"
        );

        let seq: i64 = sqlx::query_scalar(&sql)
            .bind(&event.event_id)
            .bind(&event.tenant_id)
            .bind(&event.source_node_id)
            .bind(&event.source_node_ip)
            .bind(event.event_type.as_str())
            .bind(event.event_action.as_str())
            .bind(payload)
            .bind(event.event_time)
            .bind(event.expire_time)
            .bind(event.audit.add_time)
            .bind(&event.audit.add_who)
            .bind(event.audit.edit_time)
            .bind(&event.audit.edit_who)
            .bind(&event.audit.note_text)
            .bind(&event.audit.ext_property)
            .bind(&event.audit.reserved1)
            .bind(&event.audit.reserved2)
            .bind(&event.audit.reserved3)
            .fetch_one(&self.pool)
            .await?;

        Ok(seq)
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<ClusterEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS}, {AUDIT_COLUMNS} FROM cluster_events WHERE event_id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn list_unacked_events(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS}, {AUDIT_COLUMNS}
             FROM cluster_events e
             WHERE e.event_time >= $2
               AND NOT EXISTS (
                   SELECT 1 FROM cluster_event_acks a
                   WHERE a.event_id = e.event_id AND a.node_id = $1
               )
             ORDER BY e.seq ASC
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(node_id)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_stored_event).collect()
    }

    async fn insert_ack(&self, ack: &ClusterEventAck) -> Result<bool> {
        let sql = format!(
            "INSERT INTO cluster_event_acks ({ACK_COLUMNS}, {AUDIT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 'Y',
                     $15, $16, $17, $18, $19)
             ON CONFLICT (event_id, node_id) DO NOTHING"
        );

        let result = sqlx::query(&sql)
            .bind(&ack.ack_id)
            .bind(&ack.tenant_id)
            .bind(&ack.event_id)
            .bind(&ack.node_id)
            .bind(&ack.node_ip)
            .bind(ack.ack_status.as_str())
            .bind(ack.process_time)
            .bind(&ack.result_message)
            .bind(ack.retry_count)
            .bind(ack.audit.add_time)
            .bind(&ack.audit.add_who)
            .bind(ack.audit.edit_time)
            .bind(&ack.audit.edit_who)
            .bind(ack.audit.version)
            .bind(&ack.audit.note_text)
            .bind(&ack.audit.ext_property)
            .bind(&ack.audit.reserved1)
            .bind(&ack.audit.reserved2)
            .bind(&ack.audit.reserved3)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_ack(&self, event_id: &str, node_id: &str) -> Result<Option<ClusterEventAck>> {
        let sql = format!(
            "SELECT {ACK_COLUMNS}, {AUDIT_COLUMNS}
             FROM cluster_event_acks
             WHERE event_id = $1 AND node_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(event_id)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_ack).transpose()
    }

    async fn update_ack(
        &self,
        ack: &ClusterEventAck,
        expected_version: i64,
    ) -> Result<ClusterEventAck> {
        let sql = format!(
            "UPDATE cluster_event_acks
             SET ack_status = $3,
                 process_time = $4,
                 result_message = $5,
                 retry_count = $6,
                 edit_time = $7,
                 edit_who = $8,
                 version = version + 1
             WHERE event_id = $1 AND node_id = $2
               AND version = $9 AND ack_status = 'PENDING'
             RETURNING {ACK_COLUMNS}, {AUDIT_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(&ack.event_id)
            .bind(&ack.node_id)
            .bind(ack.ack_status.as_str())
            .bind(ack.process_time)
            .bind(&ack.result_message)
            .bind(ack.retry_count)
            .bind(ack.audit.edit_time)
            .bind(&ack.audit.edit_who)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_ack(&row),
            None => match self.get_ack(&ack.event_id, &ack.node_id).await? {
                Some(_) => Err(Error::OptimisticLockConflict),
                None => Err(Error::NotFound(format!("ack for event {}", ack.event_id))),
            },
        }
    }

    async fn list_pending_acks(
        &self,
        node_id: &str,
        after: Option<AckPosition>,
        limit: i64,
    ) -> Result<Vec<ClusterEventAck>> {
        let sql = format!(
            "SELECT {ACK_COLUMNS}, {AUDIT_COLUMNS}
             FROM cluster_event_acks
             WHERE node_id = $1 AND ack_status = 'PENDING'
               AND ($2::timestamptz IS NULL OR (add_time, ack_id) > ($2, $3))
             ORDER BY add_time ASC, ack_id ASC
             LIMIT $4"
        );
        let (after_time, after_id) = match after {
            Some(pos) => (Some(pos.add_time), Some(pos.ack_id)),
            None => (None, None),
        };
        let rows = sqlx::query(&sql)
            .bind(node_id)
            .bind(after_time)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_ack).collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        // Acks go with their event through ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM cluster_events WHERE event_time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Parse the tag and payload columns of an event row
fn decode_event_body(
    event_type: &str,
    event_action: &str,
    payload: &str,
) -> Result<(EventType, EventAction, serde_json::Value)> {
    let payload = serde_json::from_str(payload).map_err(|e| Error::Deserialization {
        context: format!("event payload: {e}"),
    })?;
    Ok((event_type.parse()?, event_action.parse()?, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_event_body() {
        let (event_type, action, payload) =
            decode_event_body("CONFIG_SYNC", "CONFIG_UPDATED", r#"{"configDataId":"a"}"#).unwrap();
        assert_eq!(event_type, EventType::ConfigSync);
        assert_eq!(action, EventAction::ConfigUpdated);
        assert_eq!(payload, json!({"configDataId": "a"}));
    }

    #[test]
    fn test_decode_event_body_rejects_unknown_tags() {
        let err = decode_event_body("TUNNEL", "START", "{}").unwrap_err();
        assert!(err.to_string().contains("TUNNEL"));

        assert!(decode_event_body("GATEWAY_INSTANCE", "EXPLODE", "{}").is_err());
        assert!(matches!(
            decode_event_body("GATEWAY_INSTANCE", "START", "not json"),
            Err(Error::Deserialization { .. })
        ));
    }
}
