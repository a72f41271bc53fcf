//! The closed set of coordination event names.

pub const TASK_CREATED: &str = "task:created";
pub const TASK_COMPLETED: &str = "task:completed";
pub const TASK_FAILED: &str = "task:failed";
pub const TASK_ESCALATED: &str = "task:escalated";

pub const MESSAGE_RECEIVED: &str = "message:received";
pub const MESSAGE_PROCESSED: &str = "message:processed";

pub const CONDUCTOR_BRIEFING: &str = "conductor:briefing";
pub const CONDUCTOR_REVIEW_REQUEST: &str = "conductor:review-request";
pub const CONDUCTOR_REVIEW_RESULT: &str = "conductor:review-result";
pub const CONDUCTOR_CONTEXT_READY: &str = "conductor:context-ready";
pub const CONDUCTOR_WORKFLOW_PLANNED: &str = "conductor:workflow-planned";
pub const CONDUCTOR_FEEDBACK: &str = "conductor:feedback";
pub const CONDUCTOR_LEARNING_INSIGHT: &str = "conductor:learning-insight";
pub const CONDUCTOR_SANDBOX_DRYRUN: &str = "conductor:sandbox-dryrun";

pub const DRAFT_CREATED: &str = "draft:created";
pub const DRAFT_APPROVED: &str = "draft:approved";
pub const DRAFT_REJECTED: &str = "draft:rejected";
pub const DRAFT_EDITED: &str = "draft:edited";
pub const DRAFT_SENT: &str = "draft:sent";
pub const DRAFT_AUTO_APPROVED: &str = "draft:auto_approved";
pub const DRAFT_QUALITY_REVIEWED: &str = "draft:quality-reviewed";

pub const CORRECTION_RECORDED: &str = "correction:recorded";
