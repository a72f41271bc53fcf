//! Priority task queue backed by the state store. Dispatches up to
//! `concurrency` tasks at once, retries failures with linear backoff, and
//! reports lifecycle events on a broadcast channel. Store transitions
//! always land before the matching event is emitted.
//!
//! Dispatch is driven by a notified drainer task rather than inline from
//! `enqueue`, so a burst of enqueues settles into the waiting buffer before
//! the scheduler picks the highest-priority entry.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use crate::core::store::{AgentOutput, StateStore, TaskRecord, TaskStatus};

pub type TaskHandler = Arc<
    dyn Fn(TaskRecord) -> Pin<Box<dyn Future<Output = Result<AgentOutput>> + Send>> + Send + Sync,
>;

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Started {
        task_id: String,
    },
    Completed {
        task_id: String,
        duration_ms: u64,
        output: AgentOutput,
    },
    Retry {
        task_id: String,
        attempt: i64,
        delay_ms: u64,
    },
    Failed {
        task_id: String,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry_delay_ms: 5_000,
        }
    }
}

struct QueueInner {
    waiting: Vec<TaskRecord>,
    handler: Option<TaskHandler>,
    running: usize,
}

pub struct TaskQueue {
    store: Arc<StateStore>,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    paused: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl TaskQueue {
    pub fn new(store: Arc<StateStore>, config: QueueConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let queue = Arc::new(Self {
            store,
            config,
            inner: Mutex::new(QueueInner {
                waiting: Vec::new(),
                handler: None,
                running: 0,
            }),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
            events,
        });

        let drainer = queue.clone();
        tokio::spawn(async move {
            loop {
                drainer.wake.notified().await;
                if drainer.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                drainer.drain();
            }
        });

        queue
    }

    /// Install the worker function. Replaces any previous handler.
    pub fn set_handler(&self, handler: TaskHandler) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handler = Some(handler);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn size(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiting
            .len()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
    }

    /// Halt dispatching. Running tasks continue to completion.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Task queue paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Task queue resumed");
        self.wake.notify_one();
    }

    /// Stop dispatching and let pending retry timers lapse (persisted
    /// queued tasks are recovered on restart).
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Persist the task as queued, insert it into the waiting buffer in
    /// priority order, and wake the drainer.
    pub async fn enqueue(self: &Arc<Self>, task: TaskRecord) -> Result<()> {
        self.store
            .update_task_status(&task.id, TaskStatus::Queued)
            .await?;
        let mut task = task;
        task.status = TaskStatus::Queued;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.waiting.push(task);
            // Stable sort: FIFO within a priority rank.
            inner.waiting.sort_by(|a, b| {
                a.priority
                    .rank()
                    .cmp(&b.priority.rank())
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Dispatch waiting tasks while capacity allows.
    fn drain(self: &Arc<Self>) {
        loop {
            if self.paused.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let (task, handler) = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.running >= self.config.concurrency || inner.waiting.is_empty() {
                    return;
                }
                let Some(handler) = inner.handler.clone() else {
                    return;
                };
                let task = inner.waiting.remove(0);
                inner.running += 1;
                (task, handler)
            };
            let queue = self.clone();
            tokio::spawn(async move {
                queue.run_task(task, handler).await;
            });
        }
    }

    async fn run_task(self: Arc<Self>, task: TaskRecord, handler: TaskHandler) {
        let started = std::time::Instant::now();
        if let Err(e) = self
            .store
            .update_task_status(&task.id, TaskStatus::Running)
            .await
        {
            warn!("Failed to mark task {} running: {}", task.id, e);
        }
        let _ = self.events.send(QueueEvent::Started {
            task_id: task.id.clone(),
        });

        let outcome = handler(task.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                if let Err(e) = self.store.set_task_result(&task.id, &output).await {
                    warn!("Failed to store result for task {}: {}", task.id, e);
                }
                if let Err(e) = self
                    .store
                    .update_task_status(&task.id, TaskStatus::Completed)
                    .await
                {
                    warn!("Failed to mark task {} completed: {}", task.id, e);
                }
                let _ = self.events.send(QueueEvent::Completed {
                    task_id: task.id.clone(),
                    duration_ms,
                    output,
                });
            }
            Err(e) => {
                self.handle_failure(&task, e.to_string()).await;
            }
        }

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.running = inner.running.saturating_sub(1);
        }
        self.wake.notify_one();
    }

    async fn handle_failure(self: &Arc<Self>, task: &TaskRecord, error: String) {
        if task.retry_count < task.max_retries {
            let attempt = match self.store.increment_task_retry(&task.id).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Failed to bump retry count for task {}: {}", task.id, e);
                    task.retry_count + 1
                }
            };
            if let Err(e) = self
                .store
                .update_task_status(&task.id, TaskStatus::Pending)
                .await
            {
                warn!("Failed to reset task {} to pending: {}", task.id, e);
            }
            // Linear backoff: base delay scaled by the attempt number.
            let delay_ms = self.config.retry_delay_ms * (task.retry_count as u64 + 1);
            let _ = self.events.send(QueueEvent::Retry {
                task_id: task.id.clone(),
                attempt,
                delay_ms,
            });
            info!(
                "Task {} failed (attempt {}), retrying in {} ms: {}",
                task.id, attempt, delay_ms, error
            );

            let queue = self.clone();
            let task_id = task.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if queue.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                match queue.store.find_task(&task_id).await {
                    Ok(Some(task)) => {
                        if let Err(e) = queue.enqueue(task).await {
                            warn!("Failed to re-enqueue task {}: {}", task_id, e);
                        }
                    }
                    Ok(None) => warn!("Task {} disappeared before retry", task_id),
                    Err(e) => warn!("Failed to reload task {} for retry: {}", task_id, e),
                }
            });
        } else {
            if let Err(e) = self
                .store
                .update_task_status(&task.id, TaskStatus::Failed)
                .await
            {
                warn!("Failed to mark task {} failed: {}", task.id, e);
            }
            let _ = self.events.send(QueueEvent::Failed {
                task_id: task.id.clone(),
                error: error.clone(),
            });
            warn!("Task {} failed permanently: {}", task.id, error);
        }
    }
}
