//! Quality conductor: reviews completed agent output on request and scores
//! every created draft. Sensitive-content patterns live in one table so the
//! rule set can grow without touching the handlers.

use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::core::bus::{events, EventBus};
use crate::core::store::{AgentOutput, DraftRecord, OutputStatus, StateStore, TaskStatus};

use super::{Conductor, Subscriptions};

const MIN_SUMMARY_CHARS: usize = 10;

fn sensitive_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                "credit-card number",
                Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").unwrap(),
            ),
            (
                "email address",
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            ),
            (
                "plaintext password",
                Regex::new(r"(?i)password\s*[:=]\s*\S+").unwrap(),
            ),
        ]
    })
}

/// First sensitive pattern matching `text`, if any.
pub fn sensitive_match(text: &str) -> Option<&'static str> {
    sensitive_patterns()
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(name, _)| *name)
}

#[derive(Debug, Clone)]
pub struct OutputReview {
    pub approved: bool,
    pub corrections: Vec<String>,
    pub score: i64,
}

/// Review a completed agent output against the quality checklist.
pub fn review_output(output: &AgentOutput) -> OutputReview {
    let mut corrections = Vec::new();

    if output.summary.trim().chars().count() < MIN_SUMMARY_CHARS {
        corrections.push("Summary missing or too short".to_string());
    }
    if output.outputs.is_empty() && output.status == OutputStatus::Completed {
        corrections.push("No outputs provided despite completed status".to_string());
    }
    for item in &output.outputs {
        if let Some(pattern) = sensitive_match(&item.content) {
            corrections.push(format!("Output contains sensitive content: {}", pattern));
        }
    }

    let approved = corrections.is_empty();
    let score = if approved {
        80
    } else {
        (80 - 20 * corrections.len() as i64).max(20)
    };
    OutputReview {
        approved,
        corrections,
        score,
    }
}

/// Score a draft 0..100; returns the score and a note per deduction.
pub fn score_draft(draft: &DraftRecord) -> (i64, Vec<String>) {
    let mut score: i64 = 100;
    let mut notes = Vec::new();

    let body_chars = draft.body.chars().count();
    if body_chars < 20 {
        score -= 30;
        notes.push("body is very short".to_string());
    }
    if body_chars > 5000 {
        score -= 10;
        notes.push("body is very long".to_string());
    }
    let subject_chars = draft
        .subject
        .as_deref()
        .unwrap_or("")
        .trim()
        .chars()
        .count();
    if subject_chars < 3 {
        score -= 15;
        notes.push("subject missing or too short".to_string());
    }
    if draft.to.is_empty() {
        score -= 25;
        notes.push("no recipients".to_string());
    }
    if let Some(pattern) = sensitive_match(&draft.body) {
        score -= 30;
        notes.push(format!("sensitive content: {}", pattern));
    }
    if draft.body.contains("!!!") || draft.body.contains("???") {
        score -= 10;
        notes.push("excessive punctuation".to_string());
    }

    (score.clamp(0, 100), notes)
}

pub struct QualityConductor {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    subscriptions: Subscriptions,
}

impl QualityConductor {
    pub fn new(store: Arc<StateStore>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            subscriptions: Subscriptions::new(),
        })
    }

    async fn handle_review_request(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let Some(task_id) = payload["taskId"].as_str() else {
            return Ok(());
        };
        let Some(task) = self.store.find_task(task_id).await? else {
            warn!("review request for unknown task {}", task_id);
            return Ok(());
        };
        let Some(output) = task.result.as_ref() else {
            warn!("review request for task {} without result", task_id);
            return Ok(());
        };

        let review = review_output(output);
        if !review.approved {
            // Send the task back for rework.
            info!(
                "Output review failed for task {}: {:?}",
                task.id, review.corrections
            );
            self.store
                .update_task_status(&task.id, TaskStatus::Running)
                .await?;
        }

        self.bus
            .publish(
                events::CONDUCTOR_REVIEW_RESULT,
                "quality",
                None,
                serde_json::json!({
                    "taskId": task.id,
                    "agentType": task.task_type,
                    "approved": review.approved,
                    "corrections": review.corrections,
                    "score": review.score,
                }),
            )
            .await;
        Ok(())
    }

    async fn handle_draft_created(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let Some(draft_id) = payload["draftId"].as_str() else {
            return Ok(());
        };
        let Some(draft) = self.store.find_draft(draft_id).await? else {
            return Ok(());
        };

        let (score, notes) = score_draft(&draft);
        let notes_text = if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        };
        self.store
            .update_draft_quality(&draft.id, score, notes_text.as_deref())
            .await?;

        info!("Draft {} scored {}", draft.id, score);
        self.bus
            .publish(
                events::DRAFT_QUALITY_REVIEWED,
                "quality",
                None,
                serde_json::json!({
                    "draftId": draft.id,
                    "score": score,
                    "notes": notes,
                }),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl Conductor for QualityConductor {
    fn name(&self) -> &'static str {
        "quality"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if self.subscriptions.is_active() {
            return Ok(());
        }
        let this = self.clone();
        let token = self
            .bus
            .subscribe(events::CONDUCTOR_REVIEW_REQUEST, move |envelope| {
                this.clone().handle_review_request(envelope.payload)
            });
        self.subscriptions.record(token);

        let this = self.clone();
        let token = self.bus.subscribe(events::DRAFT_CREATED, move |envelope| {
            this.clone().handle_draft_created(envelope.payload)
        });
        self.subscriptions.record(token);

        info!("Quality conductor started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for token in self.subscriptions.drain() {
            self.bus.unsubscribe(token);
        }
        info!("Quality conductor stopped");
        Ok(())
    }
}
