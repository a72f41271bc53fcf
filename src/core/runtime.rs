//! Wires the core together: store, bus, queue, worker invoker, conductors,
//! and the bridges between them. The embedding binary owns one `Core`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::approval::ApprovalEngine;
use crate::core::bus::{events, EventBus, SubscriptionToken};
use crate::core::conductors::{
    ChiefConductor, ChiefConfig, Conductor, ContextConductor, InboxConductor, KnowledgeSource,
    LearningConductor, LearningConfig, OperationMode, QualityConductor, WorkflowConductor,
};
use crate::core::queue::{QueueConfig, QueueEvent, TaskQueue};
use crate::core::store::{OutputStatus, SecretMap, StateStore, STORE_PATH_ENV};
use crate::core::worker::{WorkerConfig, WorkerInvoker};

const RESTART_RECOVERY_LIMIT: usize = 1_000;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub store_path: PathBuf,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub learning: LearningConfig,
    pub chief: ChiefConfig,
    pub mode: OperationMode,
}

impl CoreConfig {
    /// Defaults, with the store path taken from the single environment
    /// variable the core observes.
    pub fn from_env() -> Self {
        let store_path = std::env::var(STORE_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("coreclaw.db"));
        Self {
            store_path,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            learning: LearningConfig::default(),
            chief: ChiefConfig::default(),
            mode: OperationMode::Suggest,
        }
    }
}

pub struct Core {
    pub store: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub queue: Arc<TaskQueue>,
    pub invoker: Arc<WorkerInvoker>,
    pub approval: Arc<ApprovalEngine>,
    conductors: Vec<Arc<dyn Conductor>>,
    bridge_tokens: Vec<SubscriptionToken>,
    bridge_task: tokio::task::JoinHandle<()>,
}

impl Core {
    pub async fn start(config: CoreConfig) -> Result<Self> {
        Self::start_with_sources(config, Vec::new()).await
    }

    pub async fn start_with_sources(
        config: CoreConfig,
        knowledge_sources: Vec<Arc<dyn KnowledgeSource>>,
    ) -> Result<Self> {
        let store = Arc::new(StateStore::open(&config.store_path).await?);
        let bus = Arc::new(EventBus::new());
        let queue = TaskQueue::new(store.clone(), config.queue.clone());
        let invoker = Arc::new(WorkerInvoker::new(store.clone(), config.worker.clone()));
        let approval = ApprovalEngine::new(store.clone(), bus.clone());

        invoker.cleanup_orphans().await?;

        // The queue's worker function: run the task in a sandboxed child.
        // A failed output is reported as a handler error so the queue's
        // retry policy applies.
        {
            let invoker = invoker.clone();
            queue.set_handler(Arc::new(move |task| {
                let invoker = invoker.clone();
                Box::pin(async move {
                    let result = invoker.invoke(&task, SecretMap::new(), None).await?;
                    if result.output.status == OutputStatus::Failed {
                        anyhow::bail!("worker failed: {}", result.output.summary);
                    }
                    Ok(result.output)
                })
            }));
        }

        // Routed task:created events are the queue's intake.
        let mut bridge_tokens = Vec::new();
        {
            let store = store.clone();
            let queue = queue.clone();
            let token = bus.subscribe(events::TASK_CREATED, move |envelope| {
                let store = store.clone();
                let queue = queue.clone();
                async move {
                    if !envelope.payload["routed"].as_bool().unwrap_or(false) {
                        return Ok(());
                    }
                    let Some(task_id) = envelope.payload["taskId"].as_str() else {
                        return Ok(());
                    };
                    match store.find_task(task_id).await? {
                        Some(task) => queue.enqueue(task).await,
                        None => {
                            warn!("Routed task {} not found", task_id);
                            Ok(())
                        }
                    }
                }
            });
            bridge_tokens.push(token);
        }

        // Queue lifecycle events become bus task:* events. The store
        // transition already happened inside the queue, preserving the
        // store-before-event ordering.
        let bridge_task = {
            let bus = bus.clone();
            let mut receiver = queue.subscribe_events();
            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(QueueEvent::Completed {
                            task_id,
                            duration_ms,
                            output,
                        }) => {
                            if output.status == OutputStatus::Escalated {
                                bus.publish(
                                    events::TASK_ESCALATED,
                                    "queue",
                                    None,
                                    serde_json::json!({
                                        "taskId": task_id,
                                        "summary": output.summary,
                                    }),
                                )
                                .await;
                            }
                            bus.publish(
                                events::TASK_COMPLETED,
                                "queue",
                                None,
                                serde_json::json!({
                                    "taskId": task_id,
                                    "durationMs": duration_ms,
                                    "needsReview": output.needs_review,
                                    "status": format!("{:?}", output.status).to_lowercase(),
                                }),
                            )
                            .await;
                        }
                        Ok(QueueEvent::Failed { task_id, error }) => {
                            bus.publish(
                                events::TASK_FAILED,
                                "queue",
                                None,
                                serde_json::json!({ "taskId": task_id, "error": error }),
                            )
                            .await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Queue event bridge lagged, {} events dropped", missed);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let conductors: Vec<Arc<dyn Conductor>> = vec![
            InboxConductor::new(store.clone(), bus.clone()),
            WorkflowConductor::new(
                store.clone(),
                bus.clone(),
                approval.clone(),
                config.mode,
            ),
            ContextConductor::new(store.clone(), bus.clone(), knowledge_sources),
            QualityConductor::new(store.clone(), bus.clone()),
            LearningConductor::new(store.clone(), bus.clone(), config.learning.clone()),
            ChiefConductor::new(bus.clone(), config.chief.clone()),
        ];
        for conductor in &conductors {
            conductor.clone().start().await?;
        }

        // Best-effort restart recovery: re-enqueue persisted runnable work.
        // Steps still waiting on dependencies stay parked until Workflow
        // routes them.
        let recovered = store.find_pending_tasks(RESTART_RECOVERY_LIMIT).await?;
        let mut requeued = 0;
        for task in recovered {
            let blocked = task.payload["dependsOn"]
                .as_array()
                .map(|deps| !deps.is_empty())
                .unwrap_or(false);
            if blocked {
                continue;
            }
            queue.enqueue(task).await?;
            requeued += 1;
        }
        if requeued > 0 {
            info!("Re-enqueued {} persisted tasks", requeued);
        }

        info!("Core started ({} mode)", config.mode.as_str());
        Ok(Self {
            store,
            bus,
            queue,
            invoker,
            approval,
            conductors,
            bridge_tokens,
            bridge_task,
        })
    }

    /// Stop dispatching and timers; in-flight handlers finish on their own.
    pub async fn shutdown(&self) {
        self.queue.stop();
        for conductor in &self.conductors {
            if let Err(e) = conductor.stop().await {
                warn!("Conductor {} stop error: {}", conductor.name(), e);
            }
        }
        for token in &self.bridge_tokens {
            self.bus.unsubscribe(*token);
        }
        self.bridge_task.abort();
        info!("Core shut down");
    }
}
