//! In-process publish/subscribe for conductor coordination. Delivery is
//! synchronous within the publishing stack and in subscription order; a
//! failing handler is logged and does not stop the remaining deliveries.

pub mod events;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

/// Subscription handle; pass back to [`EventBus::unsubscribe`].
pub type SubscriptionToken = u64;

/// Subscribing to this name delivers every envelope.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: String,
    pub event_type: String,
    pub source: String,
    /// Advisory only; delivery is broadcast regardless of target.
    pub target: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: String,
}

type Handler =
    std::sync::Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

struct BusInner {
    next_token: SubscriptionToken,
    handlers: HashMap<String, Vec<(SubscriptionToken, Handler)>>,
}

pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_token: 1,
                handlers: HashMap::new(),
            }),
        }
    }

    /// Register `handler` for `event_type` (or [`WILDCARD`]). Handlers for
    /// one type run in registration order.
    pub fn subscribe<F, Fut>(&self, event_type: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler =
            std::sync::Arc::new(move |envelope| Box::pin(handler(envelope)));
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let token = inner.next_token;
        inner.next_token += 1;
        inner
            .handlers
            .entry(event_type.to_string())
            .or_default()
            .push((token, handler));
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for handlers in inner.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(t, _)| *t != token);
            removed |= handlers.len() != before;
        }
        removed
    }

    pub async fn publish(
        &self,
        event_type: &str,
        source: &str,
        target: Option<&str>,
        payload: serde_json::Value,
    ) {
        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            target: target.map(str::to_string),
            payload,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        // Snapshot matching handlers before awaiting anything, so a handler
        // that publishes or (un)subscribes never deadlocks the registry.
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut matched = Vec::new();
            if let Some(list) = inner.handlers.get(event_type) {
                matched.extend(list.iter().map(|(_, h)| h.clone()));
            }
            if let Some(list) = inner.handlers.get(WILDCARD) {
                matched.extend(list.iter().map(|(_, h)| h.clone()));
            }
            matched
        };

        for handler in handlers {
            if let Err(e) = handler(envelope.clone()).await {
                warn!(
                    "Event handler failed for {} from {}: {}",
                    envelope.event_type, envelope.source, e
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let log = log.clone();
            bus.subscribe(events::TASK_CREATED, move |_| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(label);
                    Ok(())
                }
            });
        }

        bus.publish(events::TASK_CREATED, "test", None, serde_json::json!({}))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn wildcard_receives_every_event() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.subscribe(WILDCARD, move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(events::TASK_CREATED, "test", None, serde_json::json!({}))
            .await;
        bus.publish(events::DRAFT_CREATED, "test", None, serde_json::json!({}))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_delivery() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.subscribe(events::MESSAGE_RECEIVED, |_| async {
            Err(anyhow::anyhow!("boom"))
        });
        let later = reached.clone();
        bus.subscribe(events::MESSAGE_RECEIVED, move |_| {
            let later = later.clone();
            async move {
                later.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(events::MESSAGE_RECEIVED, "test", None, serde_json::json!({}))
            .await;
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let token = bus.subscribe(events::TASK_COMPLETED, move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(events::TASK_COMPLETED, "test", None, serde_json::json!({}))
            .await;
        assert!(bus.unsubscribe(token));
        bus.publish(events::TASK_COMPLETED, "test", None, serde_json::json!({}))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn target_is_advisory_not_a_filter() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.subscribe(events::CONDUCTOR_REVIEW_REQUEST, move |envelope| {
            let seen = seen.clone();
            async move {
                assert_eq!(envelope.target.as_deref(), Some("quality"));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish(
            events::CONDUCTOR_REVIEW_REQUEST,
            "someone-else",
            Some("quality"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
