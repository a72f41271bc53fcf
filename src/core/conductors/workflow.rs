//! Workflow conductor: plans complex tasks into dependent steps, routes
//! simple tasks to the queue, and turns completed draft-producing work into
//! reviewable drafts (or dry-run reports in sandbox mode).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::approval::ApprovalEngine;
use crate::core::bus::{events, EventBus};
use crate::core::store::{NewTask, StateStore, TaskRecord, TaskStatus};

use super::{Conductor, OperationMode, Subscriptions};

/// Task types that fan out into a planned workflow.
const COMPLEX_TYPES: &[&str] = &[
    "multi-step-response",
    "batch-processing",
    "research-and-report",
];

/// Task types whose completed output becomes an outbound draft.
const DRAFT_PRODUCING_TYPES: &[&str] = &[
    "urgent-email",
    "billing-email",
    "scheduling-email",
    "general-email",
    "newsletter-email",
    "report",
];

pub struct WorkflowConductor {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    approval: Arc<ApprovalEngine>,
    mode: OperationMode,
    subscriptions: Subscriptions,
}

impl WorkflowConductor {
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        approval: Arc<ApprovalEngine>,
        mode: OperationMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            approval,
            mode,
            subscriptions: Subscriptions::new(),
        })
    }

    async fn handle_task_created(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        if payload["routed"].as_bool().unwrap_or(false) {
            return Ok(());
        }
        let Some(task_id) = payload["taskId"].as_str() else {
            return Ok(());
        };
        let Some(task) = self.store.find_task(task_id).await? else {
            warn!("task:created for unknown task {}", task_id);
            return Ok(());
        };

        if COMPLEX_TYPES.contains(&task.task_type.as_str()) {
            self.plan_workflow(&task).await
        } else {
            self.route(&task.id).await;
            Ok(())
        }
    }

    /// Republish as routed so the queue consumer picks the task up.
    async fn route(&self, task_id: &str) {
        self.bus
            .publish(
                events::TASK_CREATED,
                "workflow",
                None,
                serde_json::json!({ "taskId": task_id, "routed": true }),
            )
            .await;
    }

    fn step_task(
        parent: &TaskRecord,
        task_type: &str,
        step: usize,
        depends_on: Vec<String>,
        extra: serde_json::Value,
    ) -> NewTask {
        let mut payload = parent.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("parentTaskId".to_string(), parent.id.clone().into());
            object.insert("workflowStep".to_string(), step.into());
            object.insert(
                "dependsOn".to_string(),
                serde_json::Value::from(depends_on),
            );
            if let Some(extra_object) = extra.as_object() {
                for (key, value) in extra_object {
                    object.insert(key.clone(), value.clone());
                }
            }
        }
        let mut new_task = NewTask::new(task_type, parent.priority);
        new_task.payload = payload;
        new_task.source_channel = parent.source_channel.clone();
        new_task.source_message_id = parent.source_message_id.clone();
        new_task.conductor_id = Some("workflow".to_string());
        new_task
    }

    async fn plan_workflow(&self, task: &TaskRecord) -> Result<()> {
        let mut step_ids = Vec::new();

        match task.task_type.as_str() {
            "research-and-report" => {
                let research = self
                    .store
                    .insert_task(Self::step_task(
                        task,
                        "research",
                        1,
                        Vec::new(),
                        serde_json::json!({}),
                    ))
                    .await?;
                let report = self
                    .store
                    .insert_task(Self::step_task(
                        task,
                        "report",
                        2,
                        vec![research.id.clone()],
                        serde_json::json!({}),
                    ))
                    .await?;
                step_ids.push(research.id);
                step_ids.push(report.id);
            }
            "batch-processing" => {
                let items = task.payload["items"].as_array().cloned().unwrap_or_default();
                if items.is_empty() {
                    warn!("batch-processing task {} has no items; routing as-is", task.id);
                    self.route(&task.id).await;
                    return Ok(());
                }
                for (index, item) in items.iter().enumerate() {
                    let step = self
                        .store
                        .insert_task(Self::step_task(
                            task,
                            "batch-item",
                            index + 1,
                            Vec::new(),
                            serde_json::json!({ "item": item, "batchIndex": index }),
                        ))
                        .await?;
                    step_ids.push(step.id);
                }
            }
            "multi-step-response" => {
                let steps = task.payload["steps"].as_array().cloned().unwrap_or_default();
                if steps.is_empty() {
                    self.route(&task.id).await;
                    return Ok(());
                }
                let mut previous: Option<String> = None;
                for (index, step) in steps.iter().enumerate() {
                    let depends_on = previous.clone().into_iter().collect();
                    let inserted = self
                        .store
                        .insert_task(Self::step_task(
                            task,
                            "workflow-step",
                            index + 1,
                            depends_on,
                            serde_json::json!({ "step": step }),
                        ))
                        .await?;
                    previous = Some(inserted.id.clone());
                    step_ids.push(inserted.id);
                }
            }
            other => {
                warn!("Unknown complex task type {}; routing as-is", other);
                self.route(&task.id).await;
                return Ok(());
            }
        }

        // Record the plan on the parent so completion can be detected after
        // a restart, and mark the parent as in flight.
        let mut parent_payload = task.payload.clone();
        if let Some(object) = parent_payload.as_object_mut() {
            object.insert(
                "workflowSteps".to_string(),
                serde_json::Value::from(step_ids.clone()),
            );
        }
        self.store
            .update_task_payload(&task.id, &parent_payload)
            .await?;
        self.store
            .update_task_status(&task.id, TaskStatus::Running)
            .await?;

        info!(
            "Planned workflow for task {} with {} steps",
            task.id,
            step_ids.len()
        );
        self.bus
            .publish(
                events::CONDUCTOR_WORKFLOW_PLANNED,
                "workflow",
                None,
                serde_json::json!({ "taskId": task.id, "steps": step_ids }),
            )
            .await;

        // Steps without dependencies are runnable immediately.
        for step_id in &step_ids {
            if let Some(step) = self.store.find_task(step_id).await? {
                if step.payload["dependsOn"]
                    .as_array()
                    .map(|deps| deps.is_empty())
                    .unwrap_or(true)
                {
                    self.route(&step.id).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_task_completed(self: Arc<Self>, payload: serde_json::Value) -> Result<()> {
        let Some(task_id) = payload["taskId"].as_str() else {
            return Ok(());
        };
        let Some(task) = self.store.find_task(task_id).await? else {
            return Ok(());
        };

        self.route_unblocked_dependents(&task).await?;
        self.finish_parent_workflow(&task).await?;
        self.maybe_create_draft(&task).await?;
        Ok(())
    }

    /// Route pending tasks whose dependencies are now all satisfied.
    async fn route_unblocked_dependents(&self, completed: &TaskRecord) -> Result<()> {
        let pending = self.store.find_tasks_by_status(TaskStatus::Pending, 200).await?;
        for candidate in pending {
            let Some(depends_on) = candidate.payload["dependsOn"].as_array() else {
                continue;
            };
            let depends_on: Vec<&str> =
                depends_on.iter().filter_map(|d| d.as_str()).collect();
            if depends_on.is_empty() || !depends_on.contains(&completed.id.as_str()) {
                continue;
            }
            let mut all_done = true;
            for dep_id in &depends_on {
                match self.store.find_task(dep_id).await? {
                    Some(dep) if dep.status == TaskStatus::Completed => {}
                    _ => {
                        all_done = false;
                        break;
                    }
                }
            }
            if all_done {
                info!(
                    "Dependencies satisfied for step {}; routing",
                    candidate.id
                );
                self.route(&candidate.id).await;
            }
        }
        Ok(())
    }

    /// When the last step of a planned workflow finishes, complete the
    /// parent task.
    async fn finish_parent_workflow(&self, completed: &TaskRecord) -> Result<()> {
        let Some(parent_id) = completed.payload["parentTaskId"].as_str() else {
            return Ok(());
        };
        let Some(parent) = self.store.find_task(parent_id).await? else {
            return Ok(());
        };
        if parent.status.is_terminal() {
            return Ok(());
        }
        let Some(steps) = parent.payload["workflowSteps"].as_array() else {
            return Ok(());
        };
        for step_id in steps.iter().filter_map(|s| s.as_str()) {
            match self.store.find_task(step_id).await? {
                Some(step) if step.status == TaskStatus::Completed => {}
                _ => return Ok(()),
            }
        }
        info!("Workflow {} complete; finishing parent task", parent.id);
        self.store
            .update_task_status(&parent.id, TaskStatus::Completed)
            .await?;
        self.bus
            .publish(
                events::TASK_COMPLETED,
                "workflow",
                None,
                serde_json::json!({ "taskId": parent.id, "workflow": true }),
            )
            .await;
        Ok(())
    }

    async fn maybe_create_draft(&self, task: &TaskRecord) -> Result<()> {
        if !DRAFT_PRODUCING_TYPES.contains(&task.task_type.as_str()) {
            return Ok(());
        }
        let Some(output) = task.result.as_ref() else {
            return Ok(());
        };
        if output.outputs.is_empty() {
            return Ok(());
        }

        let channel = task.source_channel.as_deref().unwrap_or("email");
        if self.mode == OperationMode::Sandbox {
            info!(
                "Sandbox mode: suppressing draft creation for task {}",
                task.id
            );
            self.bus
                .publish(
                    events::CONDUCTOR_SANDBOX_DRYRUN,
                    "workflow",
                    None,
                    serde_json::json!({
                        "taskId": task.id,
                        "action": "create-draft",
                        "channel": channel,
                        "summary": output.summary,
                    }),
                )
                .await;
            return Ok(());
        }

        let draft = self.approval.create_draft(task, output, channel).await?;
        self.bus
            .publish(
                events::CONDUCTOR_REVIEW_REQUEST,
                "workflow",
                Some("quality"),
                serde_json::json!({ "taskId": task.id, "draftId": draft.id }),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl Conductor for WorkflowConductor {
    fn name(&self) -> &'static str {
        "workflow"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if self.subscriptions.is_active() {
            return Ok(());
        }
        let this = self.clone();
        let token = self.bus.subscribe(events::TASK_CREATED, move |envelope| {
            this.clone().handle_task_created(envelope.payload)
        });
        self.subscriptions.record(token);

        let this = self.clone();
        let token = self.bus.subscribe(events::TASK_COMPLETED, move |envelope| {
            this.clone().handle_task_completed(envelope.payload)
        });
        self.subscriptions.record(token);

        info!("Workflow conductor started ({} mode)", self.mode.as_str());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for token in self.subscriptions.drain() {
            self.bus.unsubscribe(token);
        }
        info!("Workflow conductor stopped");
        Ok(())
    }
}
