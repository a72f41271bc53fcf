//! Learning conductor: buffers recorded corrections, runs the analyser when
//! the buffer fills or on a periodic timer, and keeps per-prompt metric
//! tallies fed by review and feedback events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::bus::{events, EventBus};
use crate::core::learning::Analyser;
use crate::core::store::{PromptMetrics, StateStore};

use super::{Conductor, Subscriptions};

#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Corrections buffered before an analysis run is forced.
    pub buffer_threshold: usize,
    pub analysis_interval: Duration,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 5,
            analysis_interval: Duration::from_secs(5 * 60),
        }
    }
}

pub struct LearningConductor {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    analyser: Analyser,
    config: LearningConfig,
    buffer: Mutex<Vec<String>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Subscriptions,
}

impl LearningConductor {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        config: LearningConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            analyser: Analyser::new(store.clone()),
            store,
            bus,
            config,
            buffer: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            subscriptions: Subscriptions::new(),
        })
    }

    async fn handle_correction_recorded(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let correction_id = payload["correctionId"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let should_analyse = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(correction_id);
            buffer.len() >= self.config.buffer_threshold
        };
        if should_analyse {
            self.run_analysis().await?;
        }
        Ok(())
    }

    /// Drain the buffer and analyse. Whichever trigger (buffer threshold or
    /// timer) drains first wins; the other finds an empty buffer.
    pub async fn run_analysis(&self) -> Result<()> {
        let drained = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let insights = self.analyser.analyze().await?;
        let with_suggestions: Vec<_> = insights
            .iter()
            .filter(|insight| !insight.suggestions.is_empty())
            .collect();
        info!(
            "Learning analysis over {} buffered corrections: {} agents, {} with suggestions",
            drained.len(),
            insights.len(),
            with_suggestions.len()
        );
        if !with_suggestions.is_empty() {
            self.bus
                .publish(
                    events::CONDUCTOR_LEARNING_INSIGHT,
                    "learning",
                    Some("chief"),
                    serde_json::json!({ "insights": with_suggestions }),
                )
                .await;
        }
        Ok(())
    }

    /// Bump the active prompt's rolling tallies for an agent type.
    async fn bump_prompt_tally(&self, agent_type: &str, positive: bool) -> Result<()> {
        let prompt_name = format!("{}-system-prompt", agent_type);
        let Some(prompt) = self.store.find_active_prompt(&prompt_name).await? else {
            return Ok(());
        };
        let mut metrics = prompt.metrics.unwrap_or_else(PromptMetrics::default);
        metrics.usage_count += 1;
        if positive {
            metrics.positive_rating += 1;
        } else {
            metrics.negative_rating += 1;
        }
        self.store.update_prompt_metrics(&prompt.id, &metrics).await
    }

    async fn handle_review_result(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let Some(agent_type) = payload["agentType"].as_str() else {
            return Ok(());
        };
        let approved = payload["approved"].as_bool().unwrap_or(false);
        self.bump_prompt_tally(agent_type, approved).await
    }

    async fn handle_feedback(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let agent_type = payload["agentType"].as_str().unwrap_or("unknown");
        let rating = payload["rating"].as_str().unwrap_or("negative");
        let positive = rating == "positive";
        self.store
            .insert_feedback(
                payload["taskId"].as_str(),
                Some(agent_type),
                rating,
                payload["comment"].as_str(),
            )
            .await?;
        self.bump_prompt_tally(agent_type, positive).await
    }
}

#[async_trait]
impl Conductor for LearningConductor {
    fn name(&self) -> &'static str {
        "learning"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if self.subscriptions.is_active() {
            return Ok(());
        }

        let this = self.clone();
        let token = self
            .bus
            .subscribe(events::CORRECTION_RECORDED, move |envelope| {
                this.clone().handle_correction_recorded(envelope.payload)
            });
        self.subscriptions.record(token);

        let this = self.clone();
        let token = self
            .bus
            .subscribe(events::CONDUCTOR_REVIEW_RESULT, move |envelope| {
                this.clone().handle_review_result(envelope.payload)
            });
        self.subscriptions.record(token);

        let this = self.clone();
        let token = self
            .bus
            .subscribe(events::CONDUCTOR_FEEDBACK, move |envelope| {
                this.clone().handle_feedback(envelope.payload)
            });
        self.subscriptions.record(token);

        let this = self.clone();
        let interval = self.config.analysis_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_analysis().await {
                    warn!("Periodic learning analysis failed: {}", e);
                }
            }
        });
        *self.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("Learning conductor started");
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
        info!("Learning conductor stopped");
        Ok(())
    }
}
