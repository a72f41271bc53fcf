//! Conductor pipeline over a real store and bus: message triage, draft
//! creation on completion, quality scoring and rework, edit classification,
//! and the learning loop's insight publication.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use coreclaw::core::approval::ApprovalEngine;
use coreclaw::core::bus::{events, Envelope, EventBus, WILDCARD};
use coreclaw::core::conductors::{
    ChiefConductor, ChiefConfig, Conductor, InboxConductor, LearningConductor, LearningConfig,
    OperationMode, QualityConductor, WorkflowConductor,
};
use coreclaw::core::store::*;

struct Harness {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    approval: Arc<ApprovalEngine>,
    seen: Arc<Mutex<Vec<Envelope>>>,
    conductors: Vec<Arc<dyn Conductor>>,
}

impl Harness {
    async fn new(mode: OperationMode) -> Self {
        let store = Arc::new(StateStore::open_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let approval = ApprovalEngine::new(store.clone(), bus.clone());

        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.subscribe(WILDCARD, move |envelope| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(envelope);
                    Ok(())
                }
            });
        }

        let conductors: Vec<Arc<dyn Conductor>> = vec![
            InboxConductor::new(store.clone(), bus.clone()),
            WorkflowConductor::new(store.clone(), bus.clone(), approval.clone(), mode),
            QualityConductor::new(store.clone(), bus.clone()),
            LearningConductor::new(
                store.clone(),
                bus.clone(),
                LearningConfig {
                    buffer_threshold: 3,
                    analysis_interval: Duration::from_secs(3600),
                },
            ),
            ChiefConductor::new(bus.clone(), ChiefConfig::default()),
        ];
        for conductor in &conductors {
            conductor.clone().start().await.unwrap();
        }

        Self {
            store,
            bus,
            approval,
            seen,
            conductors,
        }
    }

    fn events_of(&self, event_type: &str) -> Vec<Envelope> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    async fn receive_message(&self, subject: &str, body: &str) -> MessageRecord {
        let message = self
            .store
            .insert_message(NewMessage {
                channel: "email".to_string(),
                from: "customer@example.com".to_string(),
                to: vec!["desk@example.com".to_string()],
                subject: Some(subject.to_string()),
                body: body.to_string(),
                thread_id: Some("thread-9".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        self.bus
            .publish(
                events::MESSAGE_RECEIVED,
                "mail-adapter",
                None,
                serde_json::json!({ "messageId": message.id }),
            )
            .await;
        message
    }
}

fn reply_output(summary: &str, content: &str) -> AgentOutput {
    AgentOutput {
        status: OutputStatus::Completed,
        priority: TaskPriority::Normal,
        summary: summary.to_string(),
        needs_review: false,
        outputs: vec![OutputItem {
            kind: "reply".to_string(),
            content: content.to_string(),
            metadata: None,
        }],
        metadata: serde_json::json!({}),
        error: None,
    }
}

#[tokio::test]
async fn urgent_message_becomes_urgent_task() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let message = harness
        .receive_message("URGENT: production incident", "everything is on fire")
        .await;

    let created = harness.events_of(events::TASK_CREATED);
    assert!(!created.is_empty());
    let task_id = created[0].payload["taskId"].as_str().unwrap();
    let task = harness.store.find_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.task_type, "urgent-email");
    assert_eq!(task.priority, TaskPriority::Urgent);
    assert_eq!(task.payload["messageId"], message.id);
    assert!(task.payload["triageReason"].as_str().is_some());

    let reloaded = harness.store.find_message(&message.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, MessageStatus::Processing);
    assert_eq!(reloaded.task_id.as_deref(), Some(task_id));

    // Workflow routes the simple task for the queue consumer.
    let routed: Vec<_> = created
        .iter()
        .filter(|e| e.payload["routed"].as_bool().unwrap_or(false))
        .collect();
    assert_eq!(routed.len(), 1);
}

#[tokio::test]
async fn completed_email_task_produces_scored_draft() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let message = harness
        .receive_message("Your invoice", "please find the invoice attached")
        .await;

    let task_id = harness.events_of(events::TASK_CREATED)[0].payload["taskId"]
        .as_str()
        .unwrap()
        .to_string();
    let output = reply_output(
        "drafted a billing reply",
        "Thanks for the invoice, payment is on the way next week.",
    );
    harness.store.set_task_result(&task_id, &output).await.unwrap();
    harness
        .store
        .update_task_status(&task_id, TaskStatus::Completed)
        .await
        .unwrap();
    harness
        .bus
        .publish(
            events::TASK_COMPLETED,
            "queue",
            None,
            serde_json::json!({ "taskId": task_id, "durationMs": 12 }),
        )
        .await;

    let drafts = harness.store.find_drafts_pending_review(10).await.unwrap();
    assert_eq!(drafts.len(), 1);
    let draft = &drafts[0];
    assert_eq!(draft.to, vec!["customer@example.com".to_string()]);
    assert_eq!(draft.subject.as_deref(), Some("Re: Your invoice"));
    assert_eq!(draft.source_message_id.as_deref(), Some(message.id.as_str()));
    assert_eq!(draft.metadata["agentType"], "billing-email");

    // Quality scored it via draft:created.
    let reloaded = harness.store.find_draft(&draft.id).await.unwrap().unwrap();
    assert_eq!(reloaded.quality_score, Some(100));
    assert_eq!(harness.events_of(events::DRAFT_QUALITY_REVIEWED).len(), 1);
    assert_eq!(harness.events_of(events::CONDUCTOR_REVIEW_REQUEST).len(), 1);

    // Sending the approved draft closes out the source message.
    harness.approval.approve(&draft.id, "reviewer").await.unwrap();
    harness.approval.mark_sent(&draft.id).await.unwrap();
    assert_eq!(harness.events_of(events::MESSAGE_PROCESSED).len(), 1);
    let handled = harness.store.find_message(&message.id).await.unwrap().unwrap();
    assert_eq!(handled.status, MessageStatus::Handled);
}

#[tokio::test]
async fn sandbox_mode_suppresses_draft_and_reports_dry_run() {
    let harness = Harness::new(OperationMode::Sandbox).await;
    harness
        .receive_message("Your invoice", "invoice attached")
        .await;

    let task_id = harness.events_of(events::TASK_CREATED)[0].payload["taskId"]
        .as_str()
        .unwrap()
        .to_string();
    harness
        .store
        .set_task_result(&task_id, &reply_output("reply drafted", "On it."))
        .await
        .unwrap();
    harness
        .store
        .update_task_status(&task_id, TaskStatus::Completed)
        .await
        .unwrap();
    harness
        .bus
        .publish(
            events::TASK_COMPLETED,
            "queue",
            None,
            serde_json::json!({ "taskId": task_id }),
        )
        .await;

    assert!(harness.store.find_drafts_pending_review(10).await.unwrap().is_empty());
    let dryruns = harness.events_of(events::CONDUCTOR_SANDBOX_DRYRUN);
    assert_eq!(dryruns.len(), 1);
    assert_eq!(dryruns[0].payload["taskId"], task_id);
}

#[tokio::test]
async fn empty_outputs_trigger_rework_loop() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let task = harness
        .store
        .insert_task(NewTask::new("general-email", TaskPriority::Normal))
        .await
        .unwrap();
    let output = AgentOutput {
        status: OutputStatus::Completed,
        priority: TaskPriority::Normal,
        summary: "finished without producing anything".to_string(),
        needs_review: true,
        outputs: Vec::new(),
        metadata: serde_json::json!({}),
        error: None,
    };
    harness.store.set_task_result(&task.id, &output).await.unwrap();
    harness
        .store
        .update_task_status(&task.id, TaskStatus::Completed)
        .await
        .unwrap();

    harness
        .bus
        .publish(
            events::CONDUCTOR_REVIEW_REQUEST,
            "chief",
            Some("quality"),
            serde_json::json!({ "taskId": task.id }),
        )
        .await;

    let results = harness.events_of(events::CONDUCTOR_REVIEW_RESULT);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].payload["approved"], false);
    let corrections: Vec<String> = results[0].payload["corrections"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        corrections,
        vec!["No outputs provided despite completed status".to_string()]
    );

    // Task went back to running for rework.
    let reworked = harness.store.find_task(&task.id).await.unwrap().unwrap();
    assert_eq!(reworked.status, TaskStatus::Running);
}

#[tokio::test]
async fn research_and_report_plans_two_ordered_steps() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let mut new_task = NewTask::new("research-and-report", TaskPriority::High);
    new_task.payload = serde_json::json!({ "topic": "carrier pricing" });
    let parent = harness.store.insert_task(new_task).await.unwrap();
    harness
        .bus
        .publish(
            events::TASK_CREATED,
            "api",
            None,
            serde_json::json!({ "taskId": parent.id }),
        )
        .await;

    let planned = harness.events_of(events::CONDUCTOR_WORKFLOW_PLANNED);
    assert_eq!(planned.len(), 1);
    let steps: Vec<String> = planned[0].payload["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_string())
        .collect();
    assert_eq!(steps.len(), 2);

    let research = harness.store.find_task(&steps[0]).await.unwrap().unwrap();
    let report = harness.store.find_task(&steps[1]).await.unwrap().unwrap();
    assert_eq!(research.task_type, "research");
    assert_eq!(report.task_type, "report");
    assert_eq!(report.payload["dependsOn"][0], research.id);
    assert_eq!(research.payload["workflowStep"], 1);
    assert_eq!(report.payload["workflowStep"], 2);

    // Only the unblocked first step is routed.
    let routed: Vec<_> = harness
        .events_of(events::TASK_CREATED)
        .into_iter()
        .filter(|e| e.payload["routed"].as_bool().unwrap_or(false))
        .collect();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].payload["taskId"], research.id);

    // Completing research routes the report step.
    harness
        .store
        .set_task_result(&research.id, &reply_output("research complete", "findings"))
        .await
        .unwrap();
    harness
        .store
        .update_task_status(&research.id, TaskStatus::Completed)
        .await
        .unwrap();
    harness
        .bus
        .publish(
            events::TASK_COMPLETED,
            "queue",
            None,
            serde_json::json!({ "taskId": research.id }),
        )
        .await;

    let routed: Vec<_> = harness
        .events_of(events::TASK_CREATED)
        .into_iter()
        .filter(|e| e.payload["routed"].as_bool().unwrap_or(false))
        .collect();
    assert_eq!(routed.len(), 2);
    assert_eq!(routed[1].payload["taskId"], report.id);
}

#[tokio::test]
async fn batch_processing_fans_out_per_item() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let mut new_task = NewTask::new("batch-processing", TaskPriority::Normal);
    new_task.payload = serde_json::json!({ "items": ["a", "b", "c"] });
    let parent = harness.store.insert_task(new_task).await.unwrap();
    harness
        .bus
        .publish(
            events::TASK_CREATED,
            "api",
            None,
            serde_json::json!({ "taskId": parent.id }),
        )
        .await;

    let planned = harness.events_of(events::CONDUCTOR_WORKFLOW_PLANNED);
    let steps = planned[0].payload["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);

    // All three are parallel and routed immediately.
    let routed: Vec<_> = harness
        .events_of(events::TASK_CREATED)
        .into_iter()
        .filter(|e| e.payload["routed"].as_bool().unwrap_or(false))
        .collect();
    assert_eq!(routed.len(), 3);
}

#[tokio::test]
async fn edit_and_reject_feed_corrections_and_learning() {
    let harness = Harness::new(OperationMode::Suggest).await;

    // Three drafts from the same agent; threshold is 3 corrections.
    let mut draft_ids = Vec::new();
    for i in 0..3 {
        let mut new_task = NewTask::new("billing-email", TaskPriority::Normal);
        new_task.payload = serde_json::json!({ "n": i });
        let task = harness.store.insert_task(new_task).await.unwrap();
        let output = reply_output(
            "drafted billing reply",
            "Dear customer, thank you for your payment. We will be in touch shortly.",
        );
        let draft = harness
            .approval
            .create_draft(&task, &output, "email")
            .await
            .unwrap();
        draft_ids.push(draft.id);
    }

    harness
        .approval
        .edit_and_approve(
            &draft_ids[0],
            "Hi there, cheers for the payment! Speak soon about everything else too.",
            None,
            Some("too formal"),
            "reviewer",
        )
        .await
        .unwrap();
    harness
        .approval
        .edit_and_approve(
            &draft_ids[1],
            "Hey, thanks a lot for sorting the payment so quickly! Talk soon friend.",
            None,
            Some("too formal"),
            "reviewer",
        )
        .await
        .unwrap();
    harness
        .approval
        .reject(&draft_ids[2], "reviewer", "wrong customer entirely")
        .await
        .unwrap();

    let corrections = harness.store.recent_corrections(10).await.unwrap();
    assert_eq!(corrections.len(), 3);
    assert!(corrections
        .iter()
        .any(|c| c.change_type == ChangeType::Rejection));

    // The third correction hit the buffer threshold and triggered analysis.
    let insights = harness.events_of(events::CONDUCTOR_LEARNING_INSIGHT);
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].target.as_deref(), Some("chief"));

    let edited = harness
        .store
        .find_draft(&draft_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edited.status, DraftStatus::EditedAndSent);
    assert!(edited.sent_at.is_some());
    assert_eq!(edited.original_body, corrections.last().map(|c| c.original_body.clone()).unwrap());
}

#[tokio::test]
async fn chief_requests_review_for_flagged_completions() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let task = harness
        .store
        .insert_task(NewTask::new("research", TaskPriority::Normal))
        .await
        .unwrap();
    harness
        .store
        .set_task_result(&task.id, &reply_output("needs a second pair of eyes", "draft"))
        .await
        .unwrap();
    harness
        .store
        .update_task_status(&task.id, TaskStatus::Completed)
        .await
        .unwrap();

    harness
        .bus
        .publish(
            events::TASK_COMPLETED,
            "queue",
            None,
            serde_json::json!({ "taskId": task.id, "needsReview": true }),
        )
        .await;

    let requests = harness.events_of(events::CONDUCTOR_REVIEW_REQUEST);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].source, "chief");
    assert_eq!(requests[0].target.as_deref(), Some("quality"));
}

#[tokio::test]
async fn feedback_events_roll_into_active_prompt_metrics() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let version = harness
        .store
        .create_prompt_version("billing-email-system-prompt", "You answer billing mail.")
        .await
        .unwrap();
    harness
        .store
        .activate_prompt_version(&version.id)
        .await
        .unwrap();

    harness
        .bus
        .publish(
            events::CONDUCTOR_FEEDBACK,
            "web-ui",
            None,
            serde_json::json!({
                "agentType": "billing-email",
                "rating": "positive",
                "comment": "great reply",
            }),
        )
        .await;
    harness
        .bus
        .publish(
            events::CONDUCTOR_FEEDBACK,
            "web-ui",
            None,
            serde_json::json!({ "agentType": "billing-email", "rating": "negative" }),
        )
        .await;

    let prompt = harness
        .store
        .find_active_prompt("billing-email-system-prompt")
        .await
        .unwrap()
        .unwrap();
    let metrics = prompt.metrics.unwrap();
    assert_eq!(metrics.usage_count, 2);
    assert_eq!(metrics.positive_rating, 1);
    assert_eq!(metrics.negative_rating, 1);
}

#[tokio::test]
async fn analyser_recomputes_prompt_metrics_from_draft_outcomes() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let version = harness
        .store
        .create_prompt_version("billing-email-system-prompt", "You answer billing mail.")
        .await
        .unwrap();
    harness
        .store
        .activate_prompt_version(&version.id)
        .await
        .unwrap();

    // Four drafts: approved, sent-after-approval, rejected, edited.
    let mut draft_ids = Vec::new();
    for _ in 0..4 {
        let task = harness
            .store
            .insert_task(NewTask::new("billing-email", TaskPriority::Normal))
            .await
            .unwrap();
        let draft = harness
            .approval
            .create_draft(
                &task,
                &reply_output("billing reply drafted", "Thanks, settling the invoice today."),
                "email",
            )
            .await
            .unwrap();
        draft_ids.push(draft.id);
    }
    harness.approval.approve(&draft_ids[0], "r").await.unwrap();
    harness.approval.approve(&draft_ids[1], "r").await.unwrap();
    harness.approval.mark_sent(&draft_ids[1]).await.unwrap();
    harness
        .approval
        .reject(&draft_ids[2], "r", "not our customer")
        .await
        .unwrap();
    harness
        .approval
        .edit_and_approve(&draft_ids[3], "Shorter answer.", None, None, "r")
        .await
        .unwrap();

    let analyser = coreclaw::core::learning::Analyser::new(harness.store.clone());
    let metrics = analyser
        .update_prompt_metrics("billing-email")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metrics.usage_count, 4);
    assert_eq!(metrics.positive_rating, 2); // approved + sent
    assert_eq!(metrics.negative_rating, 1); // rejected
    assert_eq!(metrics.correction_rate, Some(50)); // edited + rejected of 4
}

#[tokio::test]
async fn auto_approve_records_rule_and_mark_sent_guards_terminal_states() {
    let harness = Harness::new(OperationMode::Suggest).await;
    harness
        .store
        .insert_approval_rule("short-billing-replies", Some("billing-email"), Some(200))
        .await
        .unwrap();

    let task = harness
        .store
        .insert_task(NewTask::new("billing-email", TaskPriority::Normal))
        .await
        .unwrap();
    let draft = harness
        .approval
        .create_draft(
            &task,
            &reply_output("billing reply drafted", "Thanks, the invoice is booked."),
            "email",
        )
        .await
        .unwrap();

    let rule = harness
        .approval
        .find_matching_rule(&draft)
        .await
        .unwrap()
        .expect("rule should match");
    assert_eq!(rule.name, "short-billing-replies");

    let auto = harness
        .approval
        .auto_approve(&draft.id, &rule.name)
        .await
        .unwrap();
    assert_eq!(auto.status, DraftStatus::AutoApproved);
    assert_eq!(auto.auto_approve_match.as_deref(), Some("short-billing-replies"));
    assert!(auto.sent_at.is_some());

    let sent = harness.approval.mark_sent(&draft.id).await.unwrap();
    assert_eq!(sent.status, DraftStatus::Sent);

    // An edited draft is already terminally sent; mark_sent refuses it.
    let task = harness
        .store
        .insert_task(NewTask::new("billing-email", TaskPriority::Normal))
        .await
        .unwrap();
    let edited = harness
        .approval
        .create_draft(
            &task,
            &reply_output("billing reply drafted", "Original wording goes here."),
            "email",
        )
        .await
        .unwrap();
    harness
        .approval
        .edit_and_approve(&edited.id, "Fixed wording goes here.", None, None, "r")
        .await
        .unwrap();
    assert!(harness.approval.mark_sent(&edited.id).await.is_err());

    // Rejection without a reason is refused while still pending.
    let task = harness
        .store
        .insert_task(NewTask::new("billing-email", TaskPriority::Normal))
        .await
        .unwrap();
    let pending = harness
        .approval
        .create_draft(
            &task,
            &reply_output("billing reply drafted", "Some other reply body."),
            "email",
        )
        .await
        .unwrap();
    assert!(harness.approval.reject(&pending.id, "r", "  ").await.is_err());
}

#[tokio::test]
async fn conductor_start_is_idempotent_and_stop_unsubscribes() {
    let harness = Harness::new(OperationMode::Suggest).await;
    let inbox = &harness.conductors[0];

    // A second start must not double-subscribe: one triage per message.
    inbox.clone().start().await.unwrap();
    harness.receive_message("hello", "just checking in").await;
    assert_eq!(harness.events_of(events::TASK_CREATED).len(), 2); // original + routed

    // After stop, messages are ignored.
    for conductor in &harness.conductors {
        conductor.stop().await.unwrap();
    }
    harness.receive_message("hello again", "still there?").await;
    assert_eq!(harness.events_of(events::TASK_CREATED).len(), 2);
}
