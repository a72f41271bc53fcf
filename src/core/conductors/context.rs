//! Context conductor: assembles thread history and optional knowledge-source
//! results for a newly created task.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::bus::{events, EventBus};
use crate::core::store::{MessageStatus, StateStore};

use super::{Conductor, Subscriptions};

const THREAD_FETCH_LIMIT: usize = 20;
const BODY_TRIM_CHARS: usize = 500;

/// Read-only external lookup (case archives, knowledge bases). Failures are
/// logged and skipped; they never fail the conductor.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn name(&self) -> &str;
    async fn query(&self, query: &str) -> Result<serde_json::Value>;
}

pub struct ContextConductor {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    sources: Vec<Arc<dyn KnowledgeSource>>,
    subscriptions: Subscriptions,
}

impl ContextConductor {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        sources: Vec<Arc<dyn KnowledgeSource>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            sources,
            subscriptions: Subscriptions::new(),
        })
    }

    async fn handle_task_created(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        if payload["routed"].as_bool().unwrap_or(false) {
            return Ok(());
        }
        let Some(task_id) = payload["taskId"].as_str() else {
            return Ok(());
        };
        let Some(task) = self.store.find_task(task_id).await? else {
            return Ok(());
        };
        let Some(message_id) = task.source_message_id.as_deref() else {
            return Ok(());
        };
        let Some(message) = self.store.find_message(message_id).await? else {
            return Ok(());
        };
        let Some(thread_id) = message.thread_id.clone() else {
            return Ok(());
        };

        // Handled messages are fetched globally and filtered to the thread
        // in memory, preserving the observed behaviour.
        let handled = self
            .store
            .find_messages_by_status(MessageStatus::Handled, THREAD_FETCH_LIMIT)
            .await?;
        let history: Vec<serde_json::Value> = handled
            .iter()
            .filter(|m| m.thread_id.as_deref() == Some(thread_id.as_str()))
            .map(|m| {
                serde_json::json!({
                    "messageId": m.id,
                    "from": m.from,
                    "subject": m.subject,
                    "body": trim_chars(&m.body, BODY_TRIM_CHARS),
                    "createdAt": m.created_at,
                })
            })
            .collect();

        let query = task.payload["caseRef"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| message.id.clone());
        let mut knowledge = Vec::new();
        for source in &self.sources {
            match source.query(&query).await {
                Ok(result) => knowledge.push(serde_json::json!({
                    "source": source.name(),
                    "result": result,
                })),
                Err(e) => {
                    warn!("Knowledge source {} failed: {}", source.name(), e);
                }
            }
        }

        info!(
            "Context ready for task {}: {} thread messages, {} knowledge results",
            task.id,
            history.len(),
            knowledge.len()
        );
        self.bus
            .publish(
                events::CONDUCTOR_CONTEXT_READY,
                "context",
                None,
                serde_json::json!({
                    "taskId": task.id,
                    "threadId": thread_id,
                    "history": history,
                    "knowledge": knowledge,
                }),
            )
            .await;
        Ok(())
    }
}

fn trim_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[async_trait]
impl Conductor for ContextConductor {
    fn name(&self) -> &'static str {
        "context"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if self.subscriptions.is_active() {
            return Ok(());
        }
        let this = self.clone();
        let token = self.bus.subscribe(events::TASK_CREATED, move |envelope| {
            this.clone().handle_task_created(envelope.payload)
        });
        self.subscriptions.record(token);
        info!("Context conductor started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for token in self.subscriptions.drain() {
            self.bus.unsubscribe(token);
        }
        info!("Context conductor stopped");
        Ok(())
    }
}
