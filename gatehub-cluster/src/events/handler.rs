use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gatehub_core::models::{ClusterEvent, EventType};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

/// Outcome a handler reports for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandleStatus {
    Success,
    Failed,
    Skipped,
    /// Transient failure; the event is dispatched again after a backoff
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandleResult {
    pub status: HandleStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl HandleResult {
    fn with_status(status: HandleStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error: None,
            data: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(HandleStatus::Success, message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_status(HandleStatus::Skipped, message)
    }

    pub fn failed(message: impl Into<String>, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::with_status(HandleStatus::Failed, message)
        }
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self::with_status(HandleStatus::Retry, message)
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Fold the results of several handlers for the same event.
    ///
    /// Any FAILED wins, then any RETRY; all SKIPPED stays SKIPPED;
    /// otherwise SUCCESS.
    #[must_use]
    pub fn combine(mut results: Vec<Self>) -> Self {
        if results.len() <= 1 {
            return results
                .pop()
                .unwrap_or_else(|| Self::skipped("no handler registered"));
        }

        let status = if results.iter().any(|r| r.status == HandleStatus::Failed) {
            HandleStatus::Failed
        } else if results.iter().any(|r| r.status == HandleStatus::Retry) {
            HandleStatus::Retry
        } else if results.iter().all(|r| r.status == HandleStatus::Skipped) {
            HandleStatus::Skipped
        } else {
            HandleStatus::Success
        };

        let message = results
            .iter()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let error = results
            .iter()
            .filter_map(|r| r.error.as_deref())
            .collect::<Vec<_>>();

        Self {
            status,
            message,
            error: (!error.is_empty()).then(|| error.join("; ")),
            data: None,
        }
    }
}

/// Handler for one event type
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> EventType;

    fn name(&self) -> &'static str;

    async fn handle(&self, event: &ClusterEvent) -> HandleResult;
}

/// Event-type tag to handler dispatch table
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        let event_type = handler.event_type();
        debug!(event_type = %event_type, handler = handler.name(), "Event handler registered");
        self.handlers.write().entry(event_type).or_default().push(handler);
    }

    #[must_use]
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers.read().get(&event_type).map_or(0, Vec::len)
    }

    /// Run every handler bound to the event's type. An unbound type is
    /// SKIPPED, not an error.
    pub async fn dispatch(&self, event: &ClusterEvent) -> HandleResult {
        let handlers = self
            .handlers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            return HandleResult::skipped(format!(
                "no handler registered for {}",
                event.event_type
            ));
        }

        let mut results = Vec::with_capacity(handlers.len());
        for handler in handlers {
            results.push(handler.handle(event).await);
        }
        HandleResult::combine(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehub_core::models::EventAction;
    use serde_json::json;

    struct Fixed(EventType, HandleStatus);

    #[async_trait]
    impl EventHandler for Fixed {
        fn event_type(&self) -> EventType {
            self.0
        }

        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn handle(&self, _event: &ClusterEvent) -> HandleResult {
            HandleResult::with_status(self.1, "fixed")
        }
    }

    fn event(event_type: EventType) -> ClusterEvent {
        ClusterEvent::new("t1", event_type, EventAction::Reload, json!({}))
    }

    #[tokio::test]
    async fn test_unbound_type_is_skipped() {
        let table = HandlerTable::new();
        table.register(Arc::new(Fixed(EventType::AlertConfig, HandleStatus::Success)));

        let result = table.dispatch(&event(EventType::ConfigSync)).await;
        assert_eq!(result.status, HandleStatus::Skipped);
        assert_eq!(table.handler_count(EventType::AlertConfig), 1);
    }

    #[tokio::test]
    async fn test_multiple_handlers_fold() {
        let table = HandlerTable::new();
        table.register(Arc::new(Fixed(EventType::ConfigSync, HandleStatus::Success)));
        table.register(Arc::new(Fixed(EventType::ConfigSync, HandleStatus::Retry)));
        assert_eq!(
            table.dispatch(&event(EventType::ConfigSync)).await.status,
            HandleStatus::Retry
        );

        table.register(Arc::new(Fixed(EventType::ConfigSync, HandleStatus::Failed)));
        assert_eq!(
            table.dispatch(&event(EventType::ConfigSync)).await.status,
            HandleStatus::Failed
        );
    }

    #[test]
    fn test_combine_skipped_and_success() {
        let all_skipped = HandleResult::combine(vec![
            HandleResult::skipped("a"),
            HandleResult::skipped("b"),
        ]);
        assert_eq!(all_skipped.status, HandleStatus::Skipped);
        assert_eq!(all_skipped.message, "a; b");

        let mixed = HandleResult::combine(vec![
            HandleResult::skipped("a"),
            HandleResult::success("b"),
        ]);
        assert_eq!(mixed.status, HandleStatus::Success);
    }
}
