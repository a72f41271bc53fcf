//! Chief conductor: aggregates task outcomes into periodic briefings and
//! requests quality review for completed work flagged `needsReview`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::bus::{events, EventBus};

use super::{Conductor, Subscriptions};

#[derive(Debug, Clone)]
pub struct ChiefConfig {
    pub briefing_interval: Duration,
}

impl Default for ChiefConfig {
    fn default() -> Self {
        Self {
            briefing_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct BriefingWindow {
    completed: u64,
    failed: u64,
    escalations: Vec<serde_json::Value>,
}

pub struct ChiefConductor {
    bus: Arc<EventBus>,
    config: ChiefConfig,
    window: Mutex<BriefingWindow>,
    timer: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Subscriptions,
}

impl ChiefConductor {
    pub fn new(bus: Arc<EventBus>, config: ChiefConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            window: Mutex::new(BriefingWindow::default()),
            timer: Mutex::new(None),
            subscriptions: Subscriptions::new(),
        })
    }

    async fn handle_task_completed(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            window.completed += 1;
        }
        if payload["needsReview"].as_bool().unwrap_or(false) {
            if let Some(task_id) = payload["taskId"].as_str() {
                self.bus
                    .publish(
                        events::CONDUCTOR_REVIEW_REQUEST,
                        "chief",
                        Some("quality"),
                        serde_json::json!({ "taskId": task_id }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_task_failed(self: Arc<Self>, _payload: serde_json::Value) -> Result<()> {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.failed += 1;
        Ok(())
    }

    async fn handle_task_escalated(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.escalations.push(payload);
        Ok(())
    }

    /// Emit the current window as a briefing and reset the counters.
    pub async fn publish_briefing(&self) {
        let window = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *window)
        };
        info!(
            "Briefing: {} completed, {} failed, {} escalations",
            window.completed,
            window.failed,
            window.escalations.len()
        );
        self.bus
            .publish(
                events::CONDUCTOR_BRIEFING,
                "chief",
                None,
                serde_json::json!({
                    "completed": window.completed,
                    "failed": window.failed,
                    "escalations": window.escalations,
                }),
            )
            .await;
    }
}

#[async_trait]
impl Conductor for ChiefConductor {
    fn name(&self) -> &'static str {
        "chief"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if self.subscriptions.is_active() {
            return Ok(());
        }

        let this = self.clone();
        let token = self.bus.subscribe(events::TASK_COMPLETED, move |envelope| {
            this.clone().handle_task_completed(envelope.payload)
        });
        self.subscriptions.record(token);

        let this = self.clone();
        let token = self.bus.subscribe(events::TASK_FAILED, move |envelope| {
            this.clone().handle_task_failed(envelope.payload)
        });
        self.subscriptions.record(token);

        let this = self.clone();
        let token = self.bus.subscribe(events::TASK_ESCALATED, move |envelope| {
            this.clone().handle_task_escalated(envelope.payload)
        });
        self.subscriptions.record(token);

        let this = self.clone();
        let interval = self.config.briefing_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.publish_briefing().await;
            }
        });
        *self.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("Chief conductor started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for token in self.subscriptions.drain() {
            self.bus.unsubscribe(token);
        }
        if let Some(handle) = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        info!("Chief conductor stopped");
        Ok(())
    }
}
