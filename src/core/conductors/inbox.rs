//! Inbox conductor: triages `message:received` into a prioritised task.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::bus::{events, EventBus};
use crate::core::store::{MessageStatus, NewTask, StateStore};

use super::triage;
use super::{Conductor, Subscriptions};

pub struct InboxConductor {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    subscriptions: Subscriptions,
}

impl InboxConductor {
    pub fn new(store: Arc<StateStore>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            subscriptions: Subscriptions::new(),
        })
    }

    async fn handle_message_received(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let Some(message_id) = payload["messageId"].as_str() else {
            warn!("message:received without messageId");
            return Ok(());
        };
        let Some(message) = self.store.find_message(message_id).await? else {
            warn!("message:received for unknown message {}", message_id);
            return Ok(());
        };

        let decision = triage::triage(&message);
        info!(
            "Triaged message {} as {} ({}): {}",
            message.id,
            decision.category,
            decision.priority.as_str(),
            decision.reason
        );

        self.store
            .update_message_status(&message.id, MessageStatus::Processing)
            .await?;

        let mut new_task = NewTask::new(decision.agent_type.clone(), decision.priority);
        new_task.payload = serde_json::json!({
            "messageId": message.id,
            "category": decision.category,
            "triageReason": decision.reason,
        });
        new_task.source_channel = Some(message.channel.clone());
        new_task.source_message_id = Some(message.id.clone());
        new_task.conductor_id = Some("inbox".to_string());
        let task = self.store.insert_task(new_task).await?;
        self.store.link_message_task(&message.id, &task.id).await?;

        self.bus
            .publish(
                events::TASK_CREATED,
                "inbox",
                None,
                serde_json::json!({
                    "taskId": task.id,
                    "taskType": task.task_type,
                    "priority": task.priority.as_str(),
                    "messageId": message.id,
                }),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl Conductor for InboxConductor {
    fn name(&self) -> &'static str {
        "inbox"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if self.subscriptions.is_active() {
            return Ok(());
        }
        let this = self.clone();
        let token = self
            .bus
            .subscribe(events::MESSAGE_RECEIVED, move |envelope| {
                this.clone().handle_message_received(envelope.payload)
            });
        self.subscriptions.record(token);
        info!("Inbox conductor started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for token in self.subscriptions.drain() {
            self.bus.unsubscribe(token);
        }
        info!("Inbox conductor stopped");
        Ok(())
    }
}
