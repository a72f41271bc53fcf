use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(MessageDirection::Inbound),
            "outbound" => Some(MessageDirection::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    New,
    Processing,
    Handled,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::New => "new",
            MessageStatus::Processing => "processing",
            MessageStatus::Handled => "handled",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "new" => Some(MessageStatus::New),
            "processing" => Some(MessageStatus::Processing),
            "handled" => Some(MessageStatus::Handled),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states carry a completion timestamp.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Primary queue sort key: urgent=0, high=1, normal=2, low=3.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "urgent" => Some(TaskPriority::Urgent),
            "high" => Some(TaskPriority::High),
            "normal" => Some(TaskPriority::Normal),
            "low" => Some(TaskPriority::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Completed,
    Failed,
    Partial,
    Escalated,
}

/// A single item produced by a worker (an email body, a report, a note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Structured result returned by a sandboxed worker. Wire shape is the
/// JSON document between the stdout sentinel markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub status: OutputStatus,
    pub priority: TaskPriority,
    pub summary: String,
    pub needs_review: bool,
    #[serde(default)]
    pub outputs: Vec<OutputItem>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentOutput {
    /// Synthesised failure output. Every worker run yields a non-empty
    /// summary, error paths included.
    pub fn failed(summary: impl Into<String>, error: impl Into<String>) -> Self {
        let mut summary = summary.into();
        if summary.is_empty() {
            summary = "worker produced no output".to_string();
        }
        Self {
            status: OutputStatus::Failed,
            priority: TaskPriority::Normal,
            summary,
            needs_review: false,
            outputs: Vec::new(),
            metadata: serde_json::json!({}),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    PendingReview,
    Approved,
    Rejected,
    Sent,
    EditedAndSent,
    AutoApproved,
}

impl DraftStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DraftStatus::PendingReview => "pending_review",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Sent => "sent",
            DraftStatus::EditedAndSent => "edited_and_sent",
            DraftStatus::AutoApproved => "auto_approved",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending_review" => Some(DraftStatus::PendingReview),
            "approved" => Some(DraftStatus::Approved),
            "rejected" => Some(DraftStatus::Rejected),
            "sent" => Some(DraftStatus::Sent),
            "edited_and_sent" => Some(DraftStatus::EditedAndSent),
            "auto_approved" => Some(DraftStatus::AutoApproved),
            _ => None,
        }
    }

    /// States that stamp `reviewed_at`.
    pub fn is_reviewed(self) -> bool {
        matches!(
            self,
            DraftStatus::Approved | DraftStatus::Rejected | DraftStatus::EditedAndSent
        )
    }

    /// States that stamp `sent_at`.
    pub fn is_sent_like(self) -> bool {
        matches!(
            self,
            DraftStatus::Sent | DraftStatus::EditedAndSent | DraftStatus::AutoApproved
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    MinorEdit,
    MajorRewrite,
    ToneChange,
    FactualFix,
    Rejection,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::MinorEdit => "minor_edit",
            ChangeType::MajorRewrite => "major_rewrite",
            ChangeType::ToneChange => "tone_change",
            ChangeType::FactualFix => "factual_fix",
            ChangeType::Rejection => "rejection",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "minor_edit" => Some(ChangeType::MinorEdit),
            "major_rewrite" => Some(ChangeType::MajorRewrite),
            "tone_change" => Some(ChangeType::ToneChange),
            "factual_fix" => Some(ChangeType::FactualFix),
            "rejection" => Some(ChangeType::Rejection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(SessionStatus::Starting),
            "running" => Some(SessionStatus::Running),
            "stopped" => Some(SessionStatus::Stopped),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

// --- Records ---

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub channel: String,
    pub direction: MessageDirection,
    pub external_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub metadata: serde_json::Value,
    pub status: MessageStatus,
    pub task_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub channel: String,
    pub direction: Option<MessageDirection>,
    pub external_id: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub metadata: Option<serde_json::Value>,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    pub source_channel: Option<String>,
    pub source_message_id: Option<String>,
    pub agent_id: Option<String>,
    pub conductor_id: Option<String>,
    pub result: Option<AgentOutput>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    pub source_channel: Option<String>,
    pub source_message_id: Option<String>,
    pub conductor_id: Option<String>,
    pub max_retries: i64,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            task_type: task_type.into(),
            priority,
            payload: serde_json::json!({}),
            source_channel: None,
            source_message_id: None,
            conductor_id: None,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftRecord {
    pub id: String,
    pub task_id: String,
    pub source_message_id: Option<String>,
    pub channel: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub original_body: String,
    pub status: DraftStatus,
    pub priority: TaskPriority,
    pub conductor_notes: Option<String>,
    pub quality_score: Option<i64>,
    pub quality_notes: Option<String>,
    pub auto_approve_match: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<String>,
    pub sent_at: Option<String>,
    pub external_draft_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewDraft {
    pub task_id: String,
    pub source_message_id: Option<String>,
    pub channel: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub priority: TaskPriority,
    pub conductor_notes: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrectionRecord {
    pub id: String,
    pub draft_id: String,
    pub task_id: String,
    pub original_body: String,
    pub edited_body: String,
    pub edited_subject: Option<String>,
    pub change_type: ChangeType,
    pub feedback: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewCorrection {
    pub draft_id: String,
    pub task_id: String,
    pub original_body: String,
    pub edited_body: String,
    pub edited_subject: Option<String>,
    pub change_type: ChangeType,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub container_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: String,
    pub stopped_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMetrics {
    pub usage_count: i64,
    pub positive_rating: i64,
    pub negative_rating: i64,
    pub avg_duration_ms: Option<f64>,
    pub correction_rate: Option<i64>,
}

impl Default for PromptMetrics {
    fn default() -> Self {
        Self {
            usage_count: 0,
            positive_rating: 0,
            negative_rating: 0,
            avg_duration_ms: None,
            correction_rate: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptVersionRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub version: i64,
    pub active: bool,
    pub activated_at: Option<String>,
    pub created_at: String,
    pub metrics: Option<PromptMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub task_id: Option<String>,
    pub agent_type: Option<String>,
    pub rating: String,
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRuleRecord {
    pub id: String,
    pub name: String,
    pub agent_type: Option<String>,
    pub max_body_length: Option<i64>,
    pub enabled: bool,
    pub created_at: String,
}

/// Allow-listed secrets handed to a worker on stdin, keyed by name.
pub type SecretMap = HashMap<String, String>;
