//! Draft lifecycle and human-review engine: creation from agent output,
//! approve/reject/edit transitions, auto-approval rules, and the edit
//! classification that feeds the learning loop.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use crate::core::bus::{events, EventBus};
use crate::core::store::{
    AgentOutput, ApprovalRuleRecord, ChangeType, DraftRecord, DraftStatus, MessageStatus,
    NewCorrection, NewDraft, StateStore, TaskRecord,
};

/// Output item kinds whose content becomes a draft body.
const DRAFT_BODY_KINDS: &[&str] = &["email", "reply", "draft"];

const SUBJECT_FALLBACK_MAX: usize = 80;

pub struct ApprovalEngine {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
}

impl ApprovalEngine {
    pub fn new(store: Arc<StateStore>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { store, bus })
    }

    /// Build a pending-review draft from a completed task's output.
    pub async fn create_draft(
        &self,
        task: &TaskRecord,
        output: &AgentOutput,
        channel: &str,
    ) -> Result<DraftRecord> {
        let body = output
            .outputs
            .iter()
            .find(|item| DRAFT_BODY_KINDS.contains(&item.kind.as_str()))
            .map(|item| item.content.clone())
            .unwrap_or_else(|| output.summary.clone());

        let source_message = match task.source_message_id.as_deref() {
            Some(id) => self.store.find_message(id).await?,
            None => None,
        };
        let to = source_message
            .as_ref()
            .map(|m| vec![m.from.clone()])
            .unwrap_or_default();
        let subject = match source_message.as_ref().and_then(|m| m.subject.clone()) {
            Some(subject) if subject.to_lowercase().starts_with("re:") => Some(subject),
            Some(subject) => Some(format!("Re: {}", subject)),
            None => Some(truncate_chars(&output.summary, SUBJECT_FALLBACK_MAX)),
        };

        let draft = self
            .store
            .insert_draft(NewDraft {
                task_id: task.id.clone(),
                source_message_id: task.source_message_id.clone(),
                channel: channel.to_string(),
                to,
                cc: Vec::new(),
                subject,
                body,
                priority: output.priority,
                conductor_notes: None,
                metadata: serde_json::json!({ "agentType": task.task_type }),
            })
            .await?;

        info!("Draft {} created for task {}", draft.id, task.id);
        self.bus
            .publish(
                events::DRAFT_CREATED,
                "approval",
                None,
                serde_json::json!({
                    "draftId": draft.id,
                    "taskId": task.id,
                    "priority": draft.priority.as_str(),
                }),
            )
            .await;
        Ok(draft)
    }

    async fn load_pending(&self, draft_id: &str) -> Result<DraftRecord> {
        let Some(draft) = self.store.find_draft(draft_id).await? else {
            bail!("draft {} not found", draft_id);
        };
        if draft.status != DraftStatus::PendingReview {
            bail!(
                "draft {} is {} and cannot be reviewed",
                draft_id,
                draft.status.as_str()
            );
        }
        Ok(draft)
    }

    pub async fn approve(&self, draft_id: &str, reviewed_by: &str) -> Result<DraftRecord> {
        let draft = self.load_pending(draft_id).await?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::Approved, Some(reviewed_by))
            .await?;
        self.bus
            .publish(
                events::DRAFT_APPROVED,
                "approval",
                None,
                serde_json::json!({ "draftId": draft.id }),
            )
            .await;
        self.reload(&draft.id).await
    }

    /// Reject with a mandatory reason; records a rejection correction.
    pub async fn reject(
        &self,
        draft_id: &str,
        reviewed_by: &str,
        reason: &str,
    ) -> Result<DraftRecord> {
        if reason.trim().is_empty() {
            bail!("rejection requires a reason");
        }
        let draft = self.load_pending(draft_id).await?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::Rejected, Some(reviewed_by))
            .await?;
        let correction = self
            .store
            .insert_correction(NewCorrection {
                draft_id: draft.id.clone(),
                task_id: draft.task_id.clone(),
                original_body: draft.original_body.clone(),
                edited_body: String::new(),
                edited_subject: None,
                change_type: ChangeType::Rejection,
                feedback: Some(reason.to_string()),
            })
            .await?;
        self.bus
            .publish(
                events::DRAFT_REJECTED,
                "approval",
                None,
                serde_json::json!({ "draftId": draft.id, "reason": reason }),
            )
            .await;
        self.bus
            .publish(
                events::CORRECTION_RECORDED,
                "approval",
                None,
                serde_json::json!({
                    "correctionId": correction.id,
                    "draftId": draft.id,
                    "changeType": correction.change_type.as_str(),
                }),
            )
            .await;
        self.reload(&draft.id).await
    }

    /// Apply a human edit, classify it, and move the draft straight to
    /// `edited_and_sent`.
    pub async fn edit_and_approve(
        &self,
        draft_id: &str,
        new_body: &str,
        new_subject: Option<&str>,
        feedback: Option<&str>,
        reviewed_by: &str,
    ) -> Result<DraftRecord> {
        let draft = self.load_pending(draft_id).await?;
        let change_type = classify_edit(&draft.original_body, new_body);

        self.store
            .update_draft_body(&draft.id, new_body, new_subject)
            .await?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::EditedAndSent, Some(reviewed_by))
            .await?;
        let correction = self
            .store
            .insert_correction(NewCorrection {
                draft_id: draft.id.clone(),
                task_id: draft.task_id.clone(),
                original_body: draft.original_body.clone(),
                edited_body: new_body.to_string(),
                edited_subject: new_subject.map(str::to_string),
                change_type,
                feedback: feedback.map(str::to_string),
            })
            .await?;

        self.bus
            .publish(
                events::DRAFT_EDITED,
                "approval",
                None,
                serde_json::json!({
                    "draftId": draft.id,
                    "changeType": change_type.as_str(),
                }),
            )
            .await;
        self.bus
            .publish(
                events::CORRECTION_RECORDED,
                "approval",
                None,
                serde_json::json!({
                    "correctionId": correction.id,
                    "draftId": draft.id,
                    "changeType": change_type.as_str(),
                }),
            )
            .await;
        let reloaded = self.reload(&draft.id).await?;
        self.finalize_source_message(&reloaded).await?;
        Ok(reloaded)
    }

    pub async fn auto_approve(&self, draft_id: &str, rule_name: &str) -> Result<DraftRecord> {
        let draft = self.load_pending(draft_id).await?;
        self.store
            .set_draft_auto_approve_match(&draft.id, rule_name)
            .await?;
        self.store
            .update_draft_status(&draft.id, DraftStatus::AutoApproved, None)
            .await?;
        self.bus
            .publish(
                events::DRAFT_AUTO_APPROVED,
                "approval",
                None,
                serde_json::json!({ "draftId": draft.id, "rule": rule_name }),
            )
            .await;
        let reloaded = self.reload(&draft.id).await?;
        self.finalize_source_message(&reloaded).await?;
        Ok(reloaded)
    }

    /// Transition an approved draft to sent. `edited_and_sent` is already a
    /// terminal sent state and is not accepted here.
    pub async fn mark_sent(&self, draft_id: &str) -> Result<DraftRecord> {
        let Some(draft) = self.store.find_draft(draft_id).await? else {
            bail!("draft {} not found", draft_id);
        };
        if !matches!(
            draft.status,
            DraftStatus::Approved | DraftStatus::AutoApproved
        ) {
            bail!(
                "draft {} is {} and cannot be marked sent",
                draft_id,
                draft.status.as_str()
            );
        }
        self.store
            .update_draft_status(&draft.id, DraftStatus::Sent, None)
            .await?;
        self.bus
            .publish(
                events::DRAFT_SENT,
                "approval",
                None,
                serde_json::json!({ "draftId": draft.id }),
            )
            .await;
        let reloaded = self.reload(&draft.id).await?;
        self.finalize_source_message(&reloaded).await?;
        Ok(reloaded)
    }

    /// A draft reaching a sent-like state closes out its source message.
    async fn finalize_source_message(&self, draft: &DraftRecord) -> Result<()> {
        let Some(message_id) = draft.source_message_id.as_deref() else {
            return Ok(());
        };
        self.store
            .update_message_status(message_id, MessageStatus::Handled)
            .await?;
        self.bus
            .publish(
                events::MESSAGE_PROCESSED,
                "approval",
                None,
                serde_json::json!({ "messageId": message_id, "draftId": draft.id }),
            )
            .await;
        Ok(())
    }

    /// First enabled rule the draft satisfies, if any.
    pub async fn find_matching_rule(
        &self,
        draft: &DraftRecord,
    ) -> Result<Option<ApprovalRuleRecord>> {
        let rules = self.store.find_enabled_approval_rules().await?;
        let agent_type = draft.metadata["agentType"].as_str().unwrap_or("");
        for rule in rules {
            if let Some(rule_agent) = rule.agent_type.as_deref() {
                if rule_agent != agent_type {
                    continue;
                }
            }
            if let Some(max_len) = rule.max_body_length {
                if draft.body.chars().count() as i64 > max_len {
                    continue;
                }
            }
            return Ok(Some(rule));
        }
        Ok(None)
    }

    async fn reload(&self, draft_id: &str) -> Result<DraftRecord> {
        self.store
            .find_draft(draft_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("draft {} disappeared", draft_id))
    }
}

/// Word-set difference ratio between the original and edited body:
/// `(|edited \ original| + |original \ edited|) / (2 * max(|original|, |edited|))`
/// over lower-cased whitespace tokens.
pub fn change_ratio(original: &str, edited: &str) -> f64 {
    let original_words: HashSet<String> = original
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    let edited_words: HashSet<String> =
        edited.split_whitespace().map(str::to_lowercase).collect();

    let total = original_words.len().max(edited_words.len());
    if total == 0 {
        return 0.0;
    }
    let changed = edited_words.difference(&original_words).count()
        + original_words.difference(&edited_words).count();
    changed as f64 / (2.0 * total as f64)
}

/// Classify a human edit by how much of the wording changed.
pub fn classify_edit(original: &str, edited: &str) -> ChangeType {
    if edited.trim().is_empty() {
        return ChangeType::Rejection;
    }
    let ratio = change_ratio(original, edited);
    if ratio > 0.5 {
        ChangeType::MajorRewrite
    } else if ratio > 0.2 {
        ChangeType::ToneChange
    } else {
        ChangeType::MinorEdit
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bodies_classify_as_minor_edit() {
        let body = "hello world this is a draft";
        assert_eq!(classify_edit(body, body), ChangeType::MinorEdit);
        assert_eq!(change_ratio(body, body), 0.0);
    }

    #[test]
    fn full_rewrite_classifies_as_major() {
        let original = "hello world this is a draft";
        let edited = "completely different response text";
        assert!(change_ratio(original, edited) > 0.5);
        assert_eq!(classify_edit(original, edited), ChangeType::MajorRewrite);
    }

    #[test]
    fn empty_edit_classifies_as_rejection() {
        assert_eq!(classify_edit("anything", ""), ChangeType::Rejection);
        assert_eq!(classify_edit("anything", "   "), ChangeType::Rejection);
    }

    #[test]
    fn ratio_thresholds_bracket_the_classes() {
        // 10 original words, swap 2 -> changed = 4, ratio = 4/20 = 0.2
        let original = "one two three four five six seven eight nine ten";
        let swap_two = "one two three four five six seven eight alpha beta";
        let ratio = change_ratio(original, swap_two);
        assert!((ratio - 0.2).abs() < 1e-9);
        assert_eq!(classify_edit(original, swap_two), ChangeType::MinorEdit);

        // Swap 3 -> changed = 6, ratio = 0.3 -> tone change.
        let swap_three = "one two three four five six seven alpha beta gamma";
        assert_eq!(classify_edit(original, swap_three), ChangeType::ToneChange);

        // Swap 6 -> changed = 12, ratio = 0.6 -> major rewrite.
        let swap_six = "one two three four alpha beta gamma delta epsilon zeta";
        assert_eq!(classify_edit(original, swap_six), ChangeType::MajorRewrite);
    }

    #[test]
    fn ratio_is_case_insensitive() {
        assert_eq!(change_ratio("Hello World", "hello world"), 0.0);
    }
}
