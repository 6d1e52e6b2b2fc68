//! Integration tests for the gatehub-core stores
//!
//! Memory-backed tests always run. Postgres-backed tests need DATABASE_URL:
//! cargo test --test store_tests -- --ignored

use std::sync::Arc;

use chrono::{Duration, Utc};
use gatehub_core::{
    models::{
        AckStatus, ClusterEvent, ClusterEventAck, EventAction, EventType, HealthStatus,
        InstanceRegistration, ServiceKey, ServiceRegistration,
    },
    repository::{
        EventStore, MemoryEventStore, MemoryRegistryStore, PgEventStore, PgRegistryStore,
        RegistryStore, StoredEvent,
    },
    Error,
};
use serde_json::json;

async fn exercise_registry(store: Arc<dyn RegistryStore>, tenant: &str) {
    let service = ServiceRegistration::new(tenant, "g1", "orders").into_service();
    store.upsert_service(&service).await.unwrap();

    let a = InstanceRegistration::new(tenant, "g1", "orders", "orders-a", "10.0.0.1", 8080)
        .into_instance(100);
    let b = InstanceRegistration::new(tenant, "g1", "orders", "orders-b", "10.0.0.2", 8080)
        .with_weight(0)
        .into_instance(100);
    store.upsert_instance(&a).await.unwrap();
    let stored_b = store.upsert_instance(&b).await.unwrap();
    assert_eq!(stored_b.weight_value, 0);

    let key = ServiceKey::new(tenant, "g1", "orders");
    let listed = store.list_instances(&key).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].service_instance_id, "orders-a");
    assert_eq!(listed[1].service_instance_id, "orders-b");

    // CAS write followed by a stale write
    let mut edited = stored_b.clone();
    edited.weight_value = 50;
    let updated = store
        .update_instance(&edited, stored_b.audit.version)
        .await
        .unwrap();
    assert_eq!(updated.weight_value, 50);
    assert!(matches!(
        store.update_instance(&edited, stored_b.audit.version).await,
        Err(Error::OptimisticLockConflict)
    ));

    let deactivated = store
        .deactivate_instance(tenant, "orders-b", "admin")
        .await
        .unwrap();
    assert!(deactivated.is_some());
    assert_eq!(store.list_instances(&key).await.unwrap().len(), 1);
    assert!(matches!(
        store.update_instance(&updated, updated.audit.version + 1).await,
        Err(Error::NotFound(_))
    ));

    let stale = store
        .mark_stale_unhealthy(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(stale.iter().any(|i| i.service_instance_id == "orders-a"));
    let outcome = store
        .touch_heartbeat(tenant, "orders-a", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.restored);
    assert_eq!(outcome.instance.health_status, HealthStatus::Healthy);
}

async fn exercise_events(store: Arc<dyn EventStore>) {
    let mut event = ClusterEvent::new(
        "t1",
        EventType::GatewayInstance,
        EventAction::Reload,
        json!({"instanceId": "gw-1"}),
    );
    event.ensure_id();
    event.source_node_id = "node-a".to_string();
    store.insert_event(&event).await.unwrap();

    let since = Utc::now() - Duration::hours(1);
    let events = store.list_unacked_events("node-b", since, 100).await.unwrap();
    assert!(events.iter().any(|e| e.event_id() == event.event_id));
    let loaded = store.get_event(&event.event_id).await.unwrap().unwrap();
    assert_eq!(loaded.event_payload, json!({"instanceId": "gw-1"}));

    let ack = ClusterEventAck::pending(&event, "node-b", "10.0.0.5");
    assert!(store.insert_ack(&ack).await.unwrap());
    assert!(!store.insert_ack(&ack).await.unwrap());
    let events = store.list_unacked_events("node-b", since, 100).await.unwrap();
    assert!(!events.iter().any(|e| e.event_id() == event.event_id));

    let mut retry = ack.clone();
    retry.retry_count = 1;
    retry.process_time = Some(Utc::now());
    let retry = store.update_ack(&retry, ack.audit.version).await.unwrap();
    assert_eq!(retry.ack_status, AckStatus::Pending);

    let pending = store.list_pending_acks("node-b", None, 100).await.unwrap();
    assert!(pending.iter().any(|a| a.event_id == event.event_id));

    let mut failed = retry.clone();
    failed.ack_status = AckStatus::Failed;
    let failed = store.update_ack(&failed, retry.audit.version).await.unwrap();
    assert!(failed.is_terminal());
    assert!(matches!(
        store.update_ack(&failed, failed.audit.version).await,
        Err(Error::OptimisticLockConflict)
    ));
}

#[tokio::test]
async fn test_memory_registry_store() {
    exercise_registry(Arc::new(MemoryRegistryStore::new()), "t1").await;
}

#[tokio::test]
async fn test_memory_event_store() {
    exercise_events(Arc::new(MemoryEventStore::new())).await;
}

async fn connect() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    sqlx::migrate!("../migrations").run(&pool).await.unwrap();
    pool
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_pg_registry_store() {
    let pool = connect().await;
    let tenant = format!("it-{}", gatehub_core::models::generate_id());
    exercise_registry(Arc::new(PgRegistryStore::new(pool)), &tenant).await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_pg_event_store() {
    let pool = connect().await;
    exercise_events(Arc::new(PgEventStore::new(pool))).await;
}

#[tokio::test]
#[ignore = "Requires PostgreSQL"]
async fn test_pg_undecodable_event_row() {
    let pool = connect().await;
    let event_id = format!("bad-{}", gatehub_core::models::generate_id());
    sqlx::query(
        "INSERT INTO cluster_events (event_id, tenant_id, source_node_id, event_type,
             event_action, event_payload, add_who, edit_who)
         VALUES ($1, 't1', 'admin', 'TUNNEL', 'START', '{}', 'admin', 'admin')",
    )
    .bind(&event_id)
    .execute(&pool)
    .await
    .unwrap();

    let store = PgEventStore::new(pool);
    let node = format!("node-{}", gatehub_core::models::generate_id());
    let since = Utc::now() - Duration::minutes(5);
    let events = store.list_unacked_events(&node, since, 1000).await.unwrap();
    let row = events
        .iter()
        .find(|e| e.event_id() == event_id)
        .expect("row listed");
    match row {
        StoredEvent::Undecodable { reason, .. } => assert!(reason.contains("TUNNEL")),
        StoredEvent::Event(_) => panic!("unknown event type decoded"),
    }
}
