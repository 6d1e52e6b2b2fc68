//! Store-backed cluster event bus
//!
//! Every node polls the shared event log for events it has no ack for yet,
//! keeps one ack per (event, node) and drives it from PENDING to a terminal
//! status. The unique ack is what makes a replayed event a no-op on a node
//! that already handled it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gatehub_core::{
    config::EventBusConfig,
    models::{AckStatus, ClusterEvent, ClusterEventAck},
    repository::{AckPosition, EventStore, StoredEvent},
    Error, Result,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{EventHandler, HandleResult, HandleStatus, HandlerTable};

pub struct ClusterEventBus {
    store: Arc<dyn EventStore>,
    handlers: HandlerTable,
    node_id: String,
    node_ip: String,
    config: EventBusConfig,

    ready: AtomicBool,
    wake: Notify,
    cancel_token: CancellationToken,
}

impl ClusterEventBus {
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        node_id: impl Into<String>,
        node_ip: impl Into<String>,
        config: EventBusConfig,
    ) -> Self {
        Self {
            store,
            handlers: HandlerTable::new(),
            node_id: node_id.into(),
            node_ip: node_ip.into(),
            config,
            ready: AtomicBool::new(false),
            wake: Notify::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn node_ip(&self) -> &str {
        &self.node_ip
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.register(handler);
    }

    /// Persist an event, stamping id and source node when absent, and wake
    /// the local dispatch loop
    pub async fn publish_event(&self, mut event: ClusterEvent) -> Result<ClusterEvent> {
        event.ensure_id();
        if event.source_node_id.is_empty() {
            event.source_node_id.clone_from(&self.node_id);
            event.source_node_ip.clone_from(&self.node_ip);
        }

        let seq = self.store.insert_event(&event).await?;
        self.wake.notify_one();

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            action = %event.event_action,
            seq,
            "Cluster event published"
        );
        Ok(event)
    }

    /// Mark the bus ready. Nothing is skipped: events this node has not
    /// acked within the retention window, including those published while
    /// it was down, go out with the next poll.
    pub async fn prime(&self) -> Result<()> {
        let backlog = self
            .store
            .list_unacked_events(&self.node_id, self.retention_cutoff(), self.config.batch_size)
            .await?
            .len();
        self.ready.store(true, Ordering::Release);
        info!(node_id = %self.node_id, backlog, "Cluster event bus ready");
        Ok(())
    }

    /// Prime and spawn the dispatch, retry and GC loops
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        self.prime().await?;
        Ok(vec![
            self.spawn_dispatch_loop(),
            self.spawn_retry_loop(),
            self.spawn_gc_loop(),
        ])
    }

    pub fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.cancel_token.cancel();
        info!(node_id = %self.node_id, "Cluster event bus shutting down");
    }

    /// Dispatch events this node has not acked yet; returns how many were
    /// read. The first store error ends the batch, and whatever is still
    /// unacked is listed again by the next poll.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self
            .store
            .list_unacked_events(&self.node_id, self.retention_cutoff(), self.config.batch_size)
            .await?;

        let count = batch.len();
        for stored in batch {
            let result = match &stored {
                StoredEvent::Event(event) => self.dispatch_new(event).await.map(|_| ()),
                StoredEvent::Undecodable {
                    event_id,
                    tenant_id,
                    reason,
                } => self.skip_undecodable(tenant_id, event_id, reason).await,
            };
            if let Err(e) = result {
                warn!(event_id = %stored.event_id(), error = %e, "Event dispatch failed");
                return Err(e);
            }
        }
        Ok(count)
    }

    /// Settle a log row that cannot be decoded with a SKIPPED ack so it no
    /// longer blocks the events behind it
    async fn skip_undecodable(&self, tenant_id: &str, event_id: &str, reason: &str) -> Result<()> {
        let mut ack = ClusterEventAck::pending_for(tenant_id, event_id, &self.node_id, &self.node_ip);
        ack.ack_status = AckStatus::Skipped;
        ack.process_time = Some(Utc::now());
        ack.result_message = Some(format!("undecodable event: {reason}"));
        if self.store.insert_ack(&ack).await? {
            warn!(event_id, reason, "Skipped undecodable cluster event");
        }
        Ok(())
    }

    /// Create this node's ack for a newly seen event and run it once.
    /// Returns `None` when the ack already existed.
    pub async fn dispatch_new(&self, event: &ClusterEvent) -> Result<Option<ClusterEventAck>> {
        let ack = ClusterEventAck::pending(event, &self.node_id, &self.node_ip);
        if !self.store.insert_ack(&ack).await? {
            debug!(event_id = %event.event_id, "Event already acknowledged on this node");
            return Ok(None);
        }
        self.dispatch_ack(event, ack).await
    }

    /// One attempt at a PENDING ack.
    ///
    /// An expired event is SKIPPED without reaching any handler. RETRY keeps
    /// the ack PENDING with a bumped retry count until the count exceeds
    /// `max_retries`, after which the ack is FAILED.
    pub async fn dispatch_ack(
        &self,
        event: &ClusterEvent,
        mut ack: ClusterEventAck,
    ) -> Result<Option<ClusterEventAck>> {
        if ack.is_terminal() {
            return Ok(Some(ack));
        }
        let expected_version = ack.audit.version;

        let result = if event.is_expired() {
            HandleResult::skipped("event expired")
        } else {
            self.handlers.dispatch(event).await
        };

        ack.process_time = Some(Utc::now());
        ack.audit.touch(&self.node_id);
        match result.status {
            HandleStatus::Success => ack.ack_status = AckStatus::Success,
            HandleStatus::Skipped => ack.ack_status = AckStatus::Skipped,
            HandleStatus::Failed => ack.ack_status = AckStatus::Failed,
            HandleStatus::Retry => {
                ack.retry_count += 1;
                if ack.retry_count > self.config.max_retries {
                    ack.ack_status = AckStatus::Failed;
                }
            }
        }
        ack.result_message = Some(match &result.error {
            Some(err) => format!("{}: {err}", result.message),
            None => result.message.clone(),
        });

        let stored = match self.store.update_ack(&ack, expected_version).await {
            Ok(stored) => stored,
            Err(Error::OptimisticLockConflict) => {
                debug!(
                    event_id = %event.event_id,
                    "Ack changed concurrently, leaving it to the other writer"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match stored.ack_status {
            AckStatus::Failed => warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                retry_count = stored.retry_count,
                message = stored.result_message.as_deref().unwrap_or_default(),
                "Cluster event failed"
            ),
            AckStatus::Pending => info!(
                event_id = %event.event_id,
                retry_count = stored.retry_count,
                "Cluster event scheduled for retry"
            ),
            status => debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                status = %status,
                "Cluster event handled"
            ),
        }
        Ok(Some(stored))
    }

    /// Re-dispatch PENDING acks whose backoff has elapsed. Acks that were
    /// inserted but never processed are picked up after the first delay.
    ///
    /// Pages through the pending acks until `batch_size` due ones were
    /// attempted, so acks still backing off never hold up due ones.
    pub async fn retry_once(&self) -> Result<usize> {
        let now = Utc::now();
        let mut after: Option<AckPosition> = None;
        let mut attempted = 0;

        loop {
            let page = self
                .store
                .list_pending_acks(&self.node_id, after.take(), self.config.batch_size)
                .await?;
            let page_len = i64::try_from(page.len()).unwrap_or(i64::MAX);
            after = page.last().map(AckPosition::from);

            for ack in page {
                let since = ack.process_time.unwrap_or(ack.audit.add_time);
                let delay = chrono_duration(self.config.retry_delay(ack.retry_count.max(1)));
                if now < since + delay {
                    continue;
                }

                let Some(event) = self.store.get_event(&ack.event_id).await? else {
                    let mut orphan = ack;
                    let expected_version = orphan.audit.version;
                    orphan.ack_status = AckStatus::Skipped;
                    orphan.process_time = Some(now);
                    orphan.result_message = Some("event no longer exists".to_string());
                    if let Err(e) = self.store.update_ack(&orphan, expected_version).await {
                        debug!(event_id = %orphan.event_id, error = %e, "Orphan ack not updated");
                    }
                    continue;
                };

                attempted += 1;
                if let Err(e) = self.dispatch_ack(&event, ack).await {
                    warn!(event_id = %event.event_id, error = %e, "Event retry failed");
                }
            }

            let budget_spent = i64::try_from(attempted).unwrap_or(i64::MAX) >= self.config.batch_size;
            if page_len == 0 || page_len < self.config.batch_size || budget_spent {
                break;
            }
        }
        Ok(attempted)
    }

    /// Delete events and acks older than the retention window
    pub async fn gc_once(&self) -> Result<u64> {
        let cutoff = self.retention_cutoff();
        let purged = self.store.purge_before(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged old cluster events");
        }
        Ok(purged)
    }

    fn retention_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(self.config.retention_hours)
    }

    fn spawn_dispatch_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let poll_interval = bus.config.poll_interval();
            loop {
                tokio::select! {
                    () = bus.cancel_token.cancelled() => return,
                    () = bus.wake.notified() => {}
                    () = tokio::time::sleep(poll_interval) => {}
                }
                loop {
                    match bus.poll_once().await {
                        Ok(n) if i64::try_from(n).unwrap_or(i64::MAX) >= bus.config.batch_size => {}
                        Ok(_) => break,
                        Err(e) => {
                            error!(error = %e, "Cluster event poll failed");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_retry_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = self.clone();
        let mut timer = tokio::time::interval(bus.config.poll_interval());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = bus.cancel_token.cancelled() => return,
                    _ = timer.tick() => {
                        if let Err(e) = bus.retry_once().await {
                            warn!(error = %e, "Cluster event retry pass failed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_gc_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = self.clone();
        let mut timer = tokio::time::interval(bus.config.gc_interval());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = bus.cancel_token.cancelled() => return,
                    _ = timer.tick() => {
                        if let Err(e) = bus.gc_once().await {
                            warn!(error = %e, "Cluster event GC failed");
                        }
                    }
                }
            }
        })
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gatehub_core::models::{EventAction, EventType};
    use gatehub_core::repository::MemoryEventStore;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Replays a scripted sequence of statuses and counts invocations
    struct Scripted {
        statuses: Mutex<Vec<HandleStatus>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(statuses: &[HandleStatus]) -> Arc<Self> {
            let mut statuses = statuses.to_vec();
            statuses.reverse();
            Arc::new(Self {
                statuses: Mutex::new(statuses),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl EventHandler for Scripted {
        fn event_type(&self) -> EventType {
            EventType::ConfigSync
        }

        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, _event: &ClusterEvent) -> HandleResult {
            *self.calls.lock() += 1;
            match self.statuses.lock().pop().unwrap_or(HandleStatus::Retry) {
                HandleStatus::Success => HandleResult::success("ok"),
                HandleStatus::Failed => HandleResult::failed("boom", "handler error"),
                HandleStatus::Skipped => HandleResult::skipped("nothing to do"),
                HandleStatus::Retry => HandleResult::retry("try later"),
            }
        }
    }

    fn bus(store: Arc<MemoryEventStore>) -> ClusterEventBus {
        ClusterEventBus::new(
            store,
            "node-a",
            "10.9.0.1",
            EventBusConfig {
                max_retries: 3,
                retry_base_delay_ms: 0,
                ..Default::default()
            },
        )
    }

    fn config_event() -> ClusterEvent {
        ClusterEvent::new(
            "t1",
            EventType::ConfigSync,
            EventAction::ConfigUpdated,
            json!({"namespaceId": "g1", "groupName": "DEFAULT_GROUP", "configDataId": "a"}),
        )
    }

    #[tokio::test]
    async fn test_publish_stamps_id_and_source() {
        let bus = bus(Arc::new(MemoryEventStore::new()));
        let event = bus.publish_event(config_event()).await.unwrap();
        assert!(!event.event_id.is_empty());
        assert_eq!(event.source_node_id, "node-a");
        assert_eq!(event.source_node_ip, "10.9.0.1");
    }

    #[tokio::test]
    async fn test_success_is_terminal_and_not_replayed() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        let handler = Scripted::new(&[HandleStatus::Success]);
        bus.register_handler(handler.clone());

        let event = bus.publish_event(config_event()).await.unwrap();
        assert_eq!(bus.poll_once().await.unwrap(), 1);
        assert_eq!(bus.poll_once().await.unwrap(), 0);

        // Replaying the same event on this node does nothing
        assert!(bus.dispatch_new(&event).await.unwrap().is_none());
        assert_eq!(handler.calls(), 1);

        let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
        assert_eq!(bus.retry_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_event_skips_handlers() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        let handler = Scripted::new(&[HandleStatus::Success]);
        bus.register_handler(handler.clone());

        let event = bus
            .publish_event(
                config_event().with_expire_time(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        bus.poll_once().await.unwrap();

        assert_eq!(handler.calls(), 0);
        let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Skipped);
    }

    #[tokio::test]
    async fn test_retry_until_ceiling_then_failed() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        let handler = Scripted::new(&[]);
        bus.register_handler(handler.clone());

        let event = bus.publish_event(config_event()).await.unwrap();
        bus.poll_once().await.unwrap();

        for expected in 1..=3 {
            let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
            assert_eq!(ack.ack_status, AckStatus::Pending);
            assert_eq!(ack.retry_count, expected);
            assert_eq!(bus.retry_once().await.unwrap(), 1);
        }

        let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Failed);
        assert_eq!(ack.retry_count, 4);
        assert_eq!(handler.calls(), 4);

        // Terminal: nothing left to retry
        assert_eq!(bus.retry_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        bus.register_handler(Scripted::new(&[HandleStatus::Retry, HandleStatus::Success]));

        let event = bus.publish_event(config_event()).await.unwrap();
        bus.poll_once().await.unwrap();
        bus.retry_once().await.unwrap();

        let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
        assert_eq!(ack.retry_count, 1);
    }

    #[tokio::test]
    async fn test_failed_is_not_retried() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        let handler = Scripted::new(&[HandleStatus::Failed]);
        bus.register_handler(handler.clone());

        let event = bus.publish_event(config_event()).await.unwrap();
        bus.poll_once().await.unwrap();
        assert_eq!(bus.retry_once().await.unwrap(), 0);

        let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Failed);
        assert_eq!(ack.result_message.as_deref(), Some("boom: handler error"));
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_unhandled_type_is_skipped() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        let event = bus
            .publish_event(ClusterEvent::new(
                "t1",
                EventType::AlertConfig,
                EventAction::Reload,
                json!({}),
            ))
            .await
            .unwrap();
        bus.poll_once().await.unwrap();

        let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Skipped);
    }

    #[tokio::test]
    async fn test_each_node_acks_independently() {
        let store = Arc::new(MemoryEventStore::new());
        let a = bus(store.clone());
        let b = ClusterEventBus::new(store.clone(), "node-b", "10.9.0.2", EventBusConfig::default());
        a.register_handler(Scripted::new(&[HandleStatus::Success]));
        b.register_handler(Scripted::new(&[HandleStatus::Success]));

        let event = a.publish_event(config_event()).await.unwrap();
        a.poll_once().await.unwrap();
        b.poll_once().await.unwrap();

        for node in ["node-a", "node-b"] {
            let ack = store.get_ack(&event.event_id, node).await.unwrap().unwrap();
            assert_eq!(ack.ack_status, AckStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_prime_keeps_backlog() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        bus.publish_event(config_event()).await.unwrap();
        assert!(!bus.is_ready());

        bus.prime().await.unwrap();
        assert!(bus.is_ready());
        assert_eq!(bus.poll_once().await.unwrap(), 1);
        assert_eq!(bus.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restart_resumes_events_missed_while_down() {
        let store = Arc::new(MemoryEventStore::new());
        let first = bus(store.clone());
        first.register_handler(Scripted::new(&[HandleStatus::Success]));
        let seen = first.publish_event(config_event()).await.unwrap();
        first.poll_once().await.unwrap();
        first.shutdown();

        // Published by another node while node-a is down
        let other = ClusterEventBus::new(store.clone(), "node-b", "10.9.0.2", EventBusConfig::default());
        let missed = other.publish_event(config_event()).await.unwrap();
        let mut ancient = config_event();
        ancient.event_time = Utc::now() - chrono::Duration::hours(100);
        let ancient = other.publish_event(ancient).await.unwrap();

        let restarted = bus(store.clone());
        let handler = Scripted::new(&[HandleStatus::Success]);
        restarted.register_handler(handler.clone());
        restarted.prime().await.unwrap();
        assert_eq!(restarted.poll_once().await.unwrap(), 1);

        assert_eq!(handler.calls(), 1);
        let ack = store.get_ack(&missed.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
        assert!(store.get_ack(&ancient.event_id, "node-a").await.unwrap().is_none());
        let ack = store.get_ack(&seen.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
    }

    /// Memory store with injectable faults: a failing ack insert, rows that
    /// are not visible yet, and rows that cannot be decoded
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryEventStore,
        fail_next_ack: AtomicBool,
        hidden: Mutex<Vec<String>>,
        undecodable: Mutex<Vec<StoredEvent>>,
    }

    #[async_trait]
    impl EventStore for FaultyStore {
        async fn insert_event(&self, event: &ClusterEvent) -> Result<i64> {
            self.inner.insert_event(event).await
        }

        async fn get_event(&self, event_id: &str) -> Result<Option<ClusterEvent>> {
            self.inner.get_event(event_id).await
        }

        async fn list_unacked_events(
            &self,
            node_id: &str,
            since: chrono::DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<StoredEvent>> {
            let mut rows = Vec::new();
            let undecodable = self.undecodable.lock().clone();
            for row in undecodable {
                if self.inner.get_ack(row.event_id(), node_id).await?.is_none() {
                    rows.push(row);
                }
            }
            let hidden = self.hidden.lock().clone();
            rows.extend(
                self.inner
                    .list_unacked_events(node_id, since, limit)
                    .await?
                    .into_iter()
                    .filter(|row| !hidden.iter().any(|id| id == row.event_id())),
            );
            Ok(rows)
        }

        async fn insert_ack(&self, ack: &ClusterEventAck) -> Result<bool> {
            if self.fail_next_ack.swap(false, Ordering::AcqRel) {
                return Err(Error::Internal("connection reset".to_string()));
            }
            self.inner.insert_ack(ack).await
        }

        async fn get_ack(&self, event_id: &str, node_id: &str) -> Result<Option<ClusterEventAck>> {
            self.inner.get_ack(event_id, node_id).await
        }

        async fn update_ack(
            &self,
            ack: &ClusterEventAck,
            expected_version: i64,
        ) -> Result<ClusterEventAck> {
            self.inner.update_ack(ack, expected_version).await
        }

        async fn list_pending_acks(
            &self,
            node_id: &str,
            after: Option<AckPosition>,
            limit: i64,
        ) -> Result<Vec<ClusterEventAck>> {
            self.inner.list_pending_acks(node_id, after, limit).await
        }

        async fn purge_before(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64> {
            self.inner.purge_before(cutoff).await
        }
    }

    fn faulty_bus(store: Arc<FaultyStore>) -> ClusterEventBus {
        ClusterEventBus::new(
            store,
            "node-a",
            "10.9.0.1",
            EventBusConfig {
                retry_base_delay_ms: 0,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_failed_ack_insert_is_redelivered() {
        let store = Arc::new(FaultyStore::default());
        let bus = faulty_bus(store.clone());
        let handler = Scripted::new(&[HandleStatus::Success]);
        bus.register_handler(handler.clone());

        let event = bus.publish_event(config_event()).await.unwrap();
        store.fail_next_ack.store(true, Ordering::Release);
        assert!(bus.poll_once().await.is_err());
        assert!(store.get_ack(&event.event_id, "node-a").await.unwrap().is_none());
        assert_eq!(bus.retry_once().await.unwrap(), 0);

        assert_eq!(bus.poll_once().await.unwrap(), 1);
        let ack = store.get_ack(&event.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_late_visible_event_is_not_skipped() {
        let store = Arc::new(FaultyStore::default());
        let bus = faulty_bus(store.clone());
        bus.register_handler(Scripted::new(&[HandleStatus::Success, HandleStatus::Success]));

        // The earlier event is still uncommitted when the later one is read
        let early = bus.publish_event(config_event()).await.unwrap();
        store.hidden.lock().push(early.event_id.clone());
        let late = bus.publish_event(config_event()).await.unwrap();
        assert_eq!(bus.poll_once().await.unwrap(), 1);
        assert!(store.get_ack(&late.event_id, "node-a").await.unwrap().is_some());

        store.hidden.lock().clear();
        assert_eq!(bus.poll_once().await.unwrap(), 1);
        let ack = store.get_ack(&early.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
    }

    #[tokio::test]
    async fn test_undecodable_row_is_skipped_and_passed() {
        let store = Arc::new(FaultyStore::default());
        store.undecodable.lock().push(StoredEvent::Undecodable {
            event_id: "bad-1".to_string(),
            tenant_id: "t1".to_string(),
            reason: "unknown event type value: TUNNEL".to_string(),
        });
        let bus = faulty_bus(store.clone());
        let handler = Scripted::new(&[HandleStatus::Success]);
        bus.register_handler(handler.clone());

        let good = bus.publish_event(config_event()).await.unwrap();
        assert_eq!(bus.poll_once().await.unwrap(), 2);

        let bad = store.get_ack("bad-1", "node-a").await.unwrap().unwrap();
        assert_eq!(bad.ack_status, AckStatus::Skipped);
        assert!(bad.result_message.unwrap().contains("TUNNEL"));
        let ack = store.get_ack(&good.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
        assert_eq!(handler.calls(), 1);

        assert_eq!(bus.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_reaches_due_acks_behind_backing_off_ones() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = ClusterEventBus::new(
            store.clone(),
            "node-a",
            "10.9.0.1",
            EventBusConfig {
                batch_size: 2,
                retry_base_delay_ms: 30_000,
                retry_max_delay_ms: 60_000,
                ..Default::default()
            },
        );
        let handler = Scripted::new(&[HandleStatus::Success]);
        bus.register_handler(handler.clone());

        let now = Utc::now();
        for i in 0..3 {
            let mut event = config_event();
            event.ensure_id();
            store.insert_event(&event).await.unwrap();
            let mut ack = ClusterEventAck::pending(&event, "node-a", "10.9.0.1");
            ack.audit.add_time = now - chrono::Duration::minutes(10 - i);
            ack.process_time = Some(now);
            ack.retry_count = 1;
            store.insert_ack(&ack).await.unwrap();
        }
        let mut due = config_event();
        due.ensure_id();
        store.insert_event(&due).await.unwrap();
        let mut ack = ClusterEventAck::pending(&due, "node-a", "10.9.0.1");
        ack.audit.add_time = now - chrono::Duration::minutes(1);
        store.insert_ack(&ack).await.unwrap();

        assert_eq!(bus.retry_once().await.unwrap(), 1);
        let ack = store.get_ack(&due.event_id, "node-a").await.unwrap().unwrap();
        assert_eq!(ack.ack_status, AckStatus::Success);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_gc_purges_old_events() {
        let store = Arc::new(MemoryEventStore::new());
        let bus = bus(store.clone());
        let mut old = config_event();
        old.event_time = Utc::now() - chrono::Duration::hours(100);
        let old = bus.publish_event(old).await.unwrap();
        let fresh = bus.publish_event(config_event()).await.unwrap();

        assert_eq!(bus.gc_once().await.unwrap(), 1);
        assert!(store.get_event(&old.event_id).await.unwrap().is_none());
        assert!(store.get_event(&fresh.event_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_clears_ready() {
        let bus = Arc::new(bus(Arc::new(MemoryEventStore::new())));
        let handles = bus.start().await.unwrap();
        assert!(bus.is_ready());

        bus.shutdown();
        assert!(!bus.is_ready());
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
