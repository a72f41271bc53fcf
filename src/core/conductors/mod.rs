//! Conductors: long-lived named roles reacting to bus events. They never
//! call each other directly; every hand-off is an event.

mod chief;
mod context;
mod inbox;
mod learning;
mod quality;
pub mod triage;
mod workflow;

pub use chief::{ChiefConductor, ChiefConfig};
pub use context::{ContextConductor, KnowledgeSource};
pub use inbox::InboxConductor;
pub use learning::{LearningConductor, LearningConfig};
pub use quality::QualityConductor;
pub use workflow::WorkflowConductor;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::core::bus::SubscriptionToken;

/// How far the system may act without human confirmation. Sandbox disables
/// all outbound effects; Workflow then reports dry-runs instead of drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Sandbox,
    Suggest,
    Assist,
    Autonomous,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::Sandbox => "sandbox",
            OperationMode::Suggest => "suggest",
            OperationMode::Assist => "assist",
            OperationMode::Autonomous => "autonomous",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sandbox" => Some(OperationMode::Sandbox),
            "suggest" => Some(OperationMode::Suggest),
            "assist" => Some(OperationMode::Assist),
            "autonomous" => Some(OperationMode::Autonomous),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Conductor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register event subscriptions and timers. Idempotent: a second call
    /// on a started conductor is a no-op.
    async fn start(self: Arc<Self>) -> Result<()>;

    /// Unsubscribe every handler and stop timers.
    async fn stop(&self) -> Result<()>;
}

/// Shared bookkeeping for a conductor's bus subscriptions.
pub(crate) struct Subscriptions {
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        !self
            .tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn record(&self, token: SubscriptionToken) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token);
    }

    pub fn drain(&self) -> Vec<SubscriptionToken> {
        std::mem::take(&mut *self.tokens.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
