//! Learning analyser: turns recorded corrections into per-agent patterns,
//! improvement suggestions, and prompt-version metric rollups.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::core::store::{
    ChangeType, CorrectionRecord, DraftRecord, DraftStatus, PromptMetrics, StateStore,
};

const CORRECTIONS_WINDOW: usize = 200;
const DRAFTS_WINDOW: usize = 500;
const MAX_PATTERN_EXAMPLES: usize = 5;

/// Correction rate (percent) below which an agent gets no suggestions.
const SUGGESTION_MIN_RATE: i64 = 10;
const HIGH_CONFIDENCE_COUNT: usize = 5;
const REJECTION_PERCENT_THRESHOLD: f64 = 20.0;
const GENERAL_CLARITY_RATE: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternExample {
    pub draft_id: String,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrectionPattern {
    pub change_type: ChangeType,
    pub count: usize,
    pub percentage: f64,
    pub examples: Vec<PatternExample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub kind: String,
    pub text: String,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInsight {
    pub agent_type: String,
    pub corrections: usize,
    pub drafts: usize,
    pub correction_rate: i64,
    pub patterns: Vec<CorrectionPattern>,
    pub suggestions: Vec<Suggestion>,
}

pub struct Analyser {
    store: Arc<StateStore>,
}

impl Analyser {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Analyse the recent correction window grouped by agent type.
    pub async fn analyze(&self) -> Result<Vec<AgentInsight>> {
        let corrections = self.store.recent_corrections(CORRECTIONS_WINDOW).await?;
        let drafts = self.store.recent_drafts(DRAFTS_WINDOW).await?;
        Ok(build_insights(&corrections, &drafts))
    }

    /// Recompute the active prompt's metrics for `agent_type` from the
    /// recent draft window. Returns the new metrics when an active prompt
    /// named `<agent-type>-system-prompt` exists.
    pub async fn update_prompt_metrics(&self, agent_type: &str) -> Result<Option<PromptMetrics>> {
        let prompt_name = format!("{}-system-prompt", agent_type);
        let Some(prompt) = self.store.find_active_prompt(&prompt_name).await? else {
            return Ok(None);
        };

        let drafts = self.store.recent_drafts(DRAFTS_WINDOW).await?;
        let agent_drafts: Vec<&DraftRecord> = drafts
            .iter()
            .filter(|d| d.metadata["agentType"].as_str() == Some(agent_type))
            .collect();

        let usage_count = agent_drafts.len() as i64;
        let positive_rating = agent_drafts
            .iter()
            .filter(|d| matches!(d.status, DraftStatus::Approved | DraftStatus::Sent))
            .count() as i64;
        let negative_rating = agent_drafts
            .iter()
            .filter(|d| d.status == DraftStatus::Rejected)
            .count() as i64;
        let corrected = agent_drafts
            .iter()
            .filter(|d| {
                matches!(d.status, DraftStatus::EditedAndSent | DraftStatus::Rejected)
            })
            .count();
        let correction_rate = if agent_drafts.is_empty() {
            None
        } else {
            Some(((100.0 * corrected as f64) / agent_drafts.len() as f64).round() as i64)
        };

        let metrics = PromptMetrics {
            usage_count,
            positive_rating,
            negative_rating,
            avg_duration_ms: prompt.metrics.as_ref().and_then(|m| m.avg_duration_ms),
            correction_rate,
        };
        self.store.update_prompt_metrics(&prompt.id, &metrics).await?;
        Ok(Some(metrics))
    }
}

/// Pure analysis over a correction/draft window. Corrections are attributed
/// to an agent via the draft's `agentType` metadata.
pub fn build_insights(
    corrections: &[CorrectionRecord],
    drafts: &[DraftRecord],
) -> Vec<AgentInsight> {
    let draft_agent: BTreeMap<&str, &str> = drafts
        .iter()
        .filter_map(|d| {
            d.metadata["agentType"]
                .as_str()
                .map(|agent| (d.id.as_str(), agent))
        })
        .collect();

    let mut corrections_by_agent: BTreeMap<String, Vec<&CorrectionRecord>> = BTreeMap::new();
    for correction in corrections {
        let agent = draft_agent
            .get(correction.draft_id.as_str())
            .copied()
            .unwrap_or("unknown");
        corrections_by_agent
            .entry(agent.to_string())
            .or_default()
            .push(correction);
    }

    let mut insights = Vec::new();
    for (agent_type, agent_corrections) in corrections_by_agent {
        let agent_drafts = drafts
            .iter()
            .filter(|d| d.metadata["agentType"].as_str() == Some(agent_type.as_str()))
            .count();

        let mut by_type: BTreeMap<ChangeType, Vec<&CorrectionRecord>> = BTreeMap::new();
        for correction in &agent_corrections {
            by_type
                .entry(correction.change_type)
                .or_default()
                .push(correction);
        }

        let total = agent_corrections.len();
        let patterns: Vec<CorrectionPattern> = by_type
            .iter()
            .map(|(change_type, list)| CorrectionPattern {
                change_type: *change_type,
                count: list.len(),
                percentage: 100.0 * list.len() as f64 / total as f64,
                examples: list
                    .iter()
                    .take(MAX_PATTERN_EXAMPLES)
                    .map(|c| PatternExample {
                        draft_id: c.draft_id.clone(),
                        feedback: c.feedback.clone(),
                    })
                    .collect(),
            })
            .collect();

        let correction_rate = if agent_drafts == 0 {
            100
        } else {
            ((100.0 * total as f64) / agent_drafts as f64).round() as i64
        };

        let suggestions = build_suggestions(&agent_type, correction_rate, &patterns);
        insights.push(AgentInsight {
            agent_type,
            corrections: total,
            drafts: agent_drafts,
            correction_rate,
            patterns,
            suggestions,
        });
    }
    insights
}

fn confidence_for(count: usize) -> Confidence {
    if count >= HIGH_CONFIDENCE_COUNT {
        Confidence::High
    } else {
        Confidence::Medium
    }
}

fn build_suggestions(
    agent_type: &str,
    correction_rate: i64,
    patterns: &[CorrectionPattern],
) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();
    if correction_rate < SUGGESTION_MIN_RATE {
        return suggestions;
    }

    let pattern = |kind: ChangeType| patterns.iter().find(|p| p.change_type == kind);

    if let Some(tone) = pattern(ChangeType::ToneChange) {
        if tone.count >= 2 {
            suggestions.push(Suggestion {
                kind: "tone-guidance".to_string(),
                text: format!(
                    "{} drafts from {} needed tone adjustments; add explicit tone guidance to its prompt",
                    tone.count, agent_type
                ),
                confidence: confidence_for(tone.count),
            });
        }
    }
    if let Some(rewrite) = pattern(ChangeType::MajorRewrite) {
        if rewrite.count >= 2 {
            suggestions.push(Suggestion {
                kind: "structural-review".to_string(),
                text: format!(
                    "{} drafts from {} were largely rewritten; review the response structure it is asked to produce",
                    rewrite.count, agent_type
                ),
                confidence: confidence_for(rewrite.count),
            });
        }
    }
    if let Some(rejection) = pattern(ChangeType::Rejection) {
        if rejection.percentage >= REJECTION_PERCENT_THRESHOLD {
            suggestions.push(Suggestion {
                kind: "fundamental-rewrite".to_string(),
                text: format!(
                    "{:.0}% of {}'s corrections are outright rejections; its prompt likely needs a fundamental rewrite",
                    rejection.percentage, agent_type
                ),
                confidence: Confidence::High,
            });
        }
    }
    if correction_rate >= GENERAL_CLARITY_RATE && suggestions.is_empty() {
        suggestions.push(Suggestion {
            kind: "general-clarity".to_string(),
            text: format!(
                "{}'s drafts are corrected {}% of the time; clarify its instructions and add examples",
                agent_type, correction_rate
            ),
            confidence: Confidence::Medium,
        });
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::TaskPriority;

    fn draft(id: &str, agent: &str, status: DraftStatus) -> DraftRecord {
        DraftRecord {
            id: id.to_string(),
            task_id: "t".to_string(),
            source_message_id: None,
            channel: "email".to_string(),
            to: vec!["a@b.cc".to_string()],
            cc: Vec::new(),
            subject: Some("Re: x".to_string()),
            body: "body".to_string(),
            original_body: "body".to_string(),
            status,
            priority: TaskPriority::Normal,
            conductor_notes: None,
            quality_score: None,
            quality_notes: None,
            auto_approve_match: None,
            reviewed_by: None,
            reviewed_at: None,
            sent_at: None,
            external_draft_id: None,
            metadata: serde_json::json!({ "agentType": agent }),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn correction(draft_id: &str, change_type: ChangeType) -> CorrectionRecord {
        CorrectionRecord {
            id: format!("c-{}", draft_id),
            draft_id: draft_id.to_string(),
            task_id: "t".to_string(),
            original_body: "original".to_string(),
            edited_body: "edited".to_string(),
            edited_subject: None,
            change_type,
            feedback: Some("too stiff".to_string()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn groups_corrections_by_agent_type() {
        let drafts = vec![
            draft("d1", "billing-email", DraftStatus::EditedAndSent),
            draft("d2", "general-email", DraftStatus::EditedAndSent),
        ];
        let corrections = vec![
            correction("d1", ChangeType::ToneChange),
            correction("d2", ChangeType::MinorEdit),
        ];
        let insights = build_insights(&corrections, &drafts);
        assert_eq!(insights.len(), 2);
        let agents: Vec<&str> = insights.iter().map(|i| i.agent_type.as_str()).collect();
        assert!(agents.contains(&"billing-email"));
        assert!(agents.contains(&"general-email"));
    }

    #[test]
    fn tone_suggestion_needs_two_occurrences_and_min_rate() {
        let drafts = vec![
            draft("d1", "billing-email", DraftStatus::EditedAndSent),
            draft("d2", "billing-email", DraftStatus::EditedAndSent),
        ];
        let corrections = vec![
            correction("d1", ChangeType::ToneChange),
            correction("d2", ChangeType::ToneChange),
        ];
        let insights = build_insights(&corrections, &drafts);
        assert_eq!(insights.len(), 1);
        let suggestion = &insights[0].suggestions[0];
        assert_eq!(suggestion.kind, "tone-guidance");
        assert_eq!(suggestion.confidence, Confidence::Medium);
    }

    #[test]
    fn five_tone_changes_upgrade_confidence() {
        let drafts: Vec<DraftRecord> = (0..10)
            .map(|i| {
                draft(
                    &format!("d{}", i),
                    "billing-email",
                    DraftStatus::EditedAndSent,
                )
            })
            .collect();
        let corrections: Vec<CorrectionRecord> = (0..5)
            .map(|i| correction(&format!("d{}", i), ChangeType::ToneChange))
            .collect();
        let insights = build_insights(&corrections, &drafts);
        assert_eq!(insights[0].suggestions[0].confidence, Confidence::High);
    }

    #[test]
    fn heavy_rejection_share_triggers_fundamental_rewrite() {
        let drafts: Vec<DraftRecord> = (0..4)
            .map(|i| draft(&format!("d{}", i), "general-email", DraftStatus::Rejected))
            .collect();
        let corrections: Vec<CorrectionRecord> = (0..4)
            .map(|i| correction(&format!("d{}", i), ChangeType::Rejection))
            .collect();
        let insights = build_insights(&corrections, &drafts);
        let kinds: Vec<&str> = insights[0]
            .suggestions
            .iter()
            .map(|s| s.kind.as_str())
            .collect();
        assert!(kinds.contains(&"fundamental-rewrite"));
    }

    #[test]
    fn low_correction_rate_yields_no_suggestions() {
        let mut drafts: Vec<DraftRecord> = (0..50)
            .map(|i| draft(&format!("d{}", i), "general-email", DraftStatus::Approved))
            .collect();
        drafts.push(draft("dx", "general-email", DraftStatus::EditedAndSent));
        let corrections = vec![
            correction("dx", ChangeType::ToneChange),
            correction("dx", ChangeType::ToneChange),
        ];
        let insights = build_insights(&corrections, &drafts);
        // 2 corrections over 51 drafts -> 4% rate, below the floor.
        assert!(insights[0].suggestions.is_empty());
    }

    #[test]
    fn pattern_examples_are_capped() {
        let drafts: Vec<DraftRecord> = (0..8)
            .map(|i| {
                draft(
                    &format!("d{}", i),
                    "billing-email",
                    DraftStatus::EditedAndSent,
                )
            })
            .collect();
        let corrections: Vec<CorrectionRecord> = (0..8)
            .map(|i| correction(&format!("d{}", i), ChangeType::MinorEdit))
            .collect();
        let insights = build_insights(&corrections, &drafts);
        assert_eq!(insights[0].patterns[0].count, 8);
        assert_eq!(insights[0].patterns[0].examples.len(), 5);
    }
}
