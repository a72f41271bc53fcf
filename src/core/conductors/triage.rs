//! Deterministic triage of inbound messages. The ladder is a plain rule
//! table so it can be extended or reloaded without touching the dispatcher;
//! first matching rule wins. Terms cover English and German variants.

use crate::core::store::{MessageRecord, TaskPriority};

#[derive(Debug, Clone)]
pub struct TriageDecision {
    pub category: String,
    pub priority: TaskPriority,
    pub agent_type: String,
    pub reason: String,
}

pub struct TriageRule {
    pub name: &'static str,
    pub category: &'static str,
    pub priority: TaskPriority,
    pub agent_type: &'static str,
    /// Empty means any channel.
    pub channels: &'static [&'static str],
    pub subject_terms: &'static [&'static str],
    pub body_terms: &'static [&'static str],
    pub sender_terms: &'static [&'static str],
}

pub const TRIAGE_RULES: &[TriageRule] = &[
    TriageRule {
        name: "urgent",
        category: "urgent-email",
        priority: TaskPriority::Urgent,
        agent_type: "urgent-email",
        channels: &["email"],
        subject_terms: &["urgent:", "dringend:", "emergency"],
        body_terms: &["as soon as possible", "so schnell wie möglich"],
        sender_terms: &[],
    },
    TriageRule {
        name: "billing",
        category: "billing-email",
        priority: TaskPriority::High,
        agent_type: "billing-email",
        channels: &[],
        subject_terms: &["invoice", "rechnung", "billing", "payment", "zahlung"],
        body_terms: &["invoice", "rechnung", "payment due", "überweisung"],
        sender_terms: &[],
    },
    TriageRule {
        name: "scheduling",
        category: "scheduling-email",
        priority: TaskPriority::Normal,
        agent_type: "scheduling-email",
        channels: &[],
        subject_terms: &["meeting", "termin", "appointment", "call", "calendar"],
        body_terms: &["schedule a", "terminvorschlag", "availability"],
        sender_terms: &[],
    },
    TriageRule {
        name: "newsletter",
        category: "newsletter",
        priority: TaskPriority::Low,
        agent_type: "newsletter-email",
        channels: &[],
        subject_terms: &["newsletter", "digest"],
        body_terms: &["unsubscribe", "abmelden"],
        sender_terms: &["no-reply", "noreply", "newsletter@"],
    },
];

const DEFAULT_CATEGORY: &str = "general-email";
const DEFAULT_AGENT_TYPE: &str = "general-email";

/// Classify a message. Pure function of the record: no I/O.
pub fn triage(message: &MessageRecord) -> TriageDecision {
    let subject = message.subject.as_deref().unwrap_or("").to_lowercase();
    let body = message.body.to_lowercase();
    let sender = message.from.to_lowercase();

    for rule in TRIAGE_RULES {
        if !rule.channels.is_empty() && !rule.channels.contains(&message.channel.as_str()) {
            continue;
        }
        if let Some(term) = rule
            .subject_terms
            .iter()
            .find(|term| subject.contains(*term))
        {
            return decision(rule, "subject", term);
        }
        if let Some(term) = rule.body_terms.iter().find(|term| body.contains(*term)) {
            return decision(rule, "body", term);
        }
        if let Some(term) = rule
            .sender_terms
            .iter()
            .find(|term| sender.contains(*term))
        {
            return decision(rule, "sender", term);
        }
    }

    TriageDecision {
        category: DEFAULT_CATEGORY.to_string(),
        priority: TaskPriority::Normal,
        agent_type: DEFAULT_AGENT_TYPE.to_string(),
        reason: "no rule matched; default routing".to_string(),
    }
}

fn decision(rule: &TriageRule, field: &str, term: &str) -> TriageDecision {
    TriageDecision {
        category: rule.category.to_string(),
        priority: rule.priority,
        agent_type: rule.agent_type.to_string(),
        reason: format!("rule '{}' matched '{}' in {}", rule.name, term, field),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{MessageDirection, MessageStatus};

    fn message(channel: &str, subject: &str, body: &str, from: &str) -> MessageRecord {
        MessageRecord {
            id: "m-1".to_string(),
            channel: channel.to_string(),
            direction: MessageDirection::Inbound,
            external_id: None,
            from: from.to_string(),
            to: vec!["desk@example.com".to_string()],
            subject: Some(subject.to_string()),
            body: body.to_string(),
            metadata: serde_json::json!({}),
            status: MessageStatus::New,
            task_id: None,
            thread_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn urgent_subject_on_email_channel() {
        let decision = triage(&message(
            "email",
            "URGENT: server down",
            "please look",
            "ops@example.com",
        ));
        assert_eq!(decision.category, "urgent-email");
        assert_eq!(decision.priority, TaskPriority::Urgent);
    }

    #[test]
    fn urgent_rule_is_email_only() {
        let decision = triage(&message(
            "chat",
            "URGENT: ping",
            "hello",
            "bob@example.com",
        ));
        assert_ne!(decision.category, "urgent-email");
    }

    #[test]
    fn billing_is_language_tolerant() {
        let english = triage(&message(
            "email",
            "Your invoice for March",
            "see attachment",
            "billing@vendor.com",
        ));
        let german = triage(&message(
            "email",
            "Ihre Rechnung",
            "siehe Anhang",
            "billing@vendor.de",
        ));
        assert_eq!(english.category, "billing-email");
        assert_eq!(english.priority, TaskPriority::High);
        assert_eq!(german.category, "billing-email");
        assert_eq!(german.priority, TaskPriority::High);
    }

    #[test]
    fn newsletter_matched_by_sender() {
        let decision = triage(&message(
            "email",
            "Weekly roundup",
            "all the news",
            "no-reply@news.example.com",
        ));
        assert_eq!(decision.category, "newsletter");
        assert_eq!(decision.priority, TaskPriority::Low);
    }

    #[test]
    fn unmatched_message_falls_through_to_default() {
        let decision = triage(&message(
            "email",
            "hello there",
            "just saying hi",
            "friend@example.com",
        ));
        assert_eq!(decision.category, "general-email");
        assert_eq!(decision.priority, TaskPriority::Normal);
        assert!(decision.reason.contains("default"));
    }

    #[test]
    fn reason_names_the_matched_rule_and_term() {
        let decision = triage(&message(
            "email",
            "URGENT: outage",
            "",
            "ops@example.com",
        ));
        assert!(decision.reason.contains("urgent"));
        assert!(decision.reason.contains("subject"));
    }
}
