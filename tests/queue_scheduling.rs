//! Queue behaviour: priority dispatch order, retry backoff, exhaustion,
//! pause/resume, and the concurrency ceiling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use coreclaw::core::queue::{QueueConfig, QueueEvent, TaskQueue};
use coreclaw::core::store::{
    AgentOutput, NewTask, OutputStatus, StateStore, TaskPriority, TaskStatus,
};

fn ok_output(summary: &str) -> AgentOutput {
    AgentOutput {
        status: OutputStatus::Completed,
        priority: TaskPriority::Normal,
        summary: summary.to_string(),
        needs_review: false,
        outputs: Vec::new(),
        metadata: serde_json::json!({}),
        error: None,
    }
}

async fn store() -> Arc<StateStore> {
    Arc::new(StateStore::open_in_memory().await.unwrap())
}

#[tokio::test]
async fn urgent_task_dispatches_before_earlier_low_task() {
    let store = store().await;
    let queue = TaskQueue::new(
        store.clone(),
        QueueConfig {
            concurrency: 1,
            retry_delay_ms: 10,
        },
    );
    queue.set_handler(Arc::new(|_task| {
        Box::pin(async { Ok(ok_output("instant handler")) })
    }));
    let mut events = queue.subscribe_events();

    let low = store
        .insert_task(NewTask::new("low-work", TaskPriority::Low))
        .await
        .unwrap();
    let urgent = store
        .insert_task(NewTask::new("urgent-work", TaskPriority::Urgent))
        .await
        .unwrap();
    queue.enqueue(low.clone()).await.unwrap();
    queue.enqueue(urgent.clone()).await.unwrap();

    let mut completed = Vec::new();
    while completed.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("queue events should arrive")
            .unwrap()
        {
            QueueEvent::Completed { task_id, .. } => completed.push(task_id),
            _ => {}
        }
    }
    assert_eq!(completed, vec![urgent.id.clone(), low.id.clone()]);
}

#[tokio::test]
async fn failing_handler_retries_with_backoff_then_completes() {
    let store = store().await;
    let queue = TaskQueue::new(
        store.clone(),
        QueueConfig {
            concurrency: 1,
            retry_delay_ms: 50,
        },
    );
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    queue.set_handler(Arc::new(move |_task| {
        let counter = counter.clone();
        Box::pin(async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("transient failure")
            }
            Ok(ok_output("third time lucky"))
        })
    }));
    let mut events = queue.subscribe_events();

    let task = store
        .insert_task(NewTask::new("flaky-work", TaskPriority::Normal))
        .await
        .unwrap();
    let started = Instant::now();
    queue.enqueue(task.clone()).await.unwrap();

    let mut retries = 0;
    let mut retry_delays = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("queue events should arrive")
            .unwrap()
        {
            QueueEvent::Retry { delay_ms, .. } => {
                retries += 1;
                retry_delays.push(delay_ms);
            }
            QueueEvent::Completed { task_id, .. } => {
                assert_eq!(task_id, task.id);
                break;
            }
            QueueEvent::Failed { .. } => panic!("task should eventually complete"),
            QueueEvent::Started { .. } => {}
        }
    }

    assert_eq!(retries, 2);
    // Linear backoff: first retry at base delay, second at twice.
    assert_eq!(retry_delays, vec![50, 100]);
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let final_task = store.find_task(&task.id).await.unwrap().unwrap();
    assert_eq!(final_task.status, TaskStatus::Completed);
    assert_eq!(final_task.retry_count, 2);
}

#[tokio::test]
async fn retries_exhaust_into_failed_status() {
    let store = store().await;
    let queue = TaskQueue::new(
        store.clone(),
        QueueConfig {
            concurrency: 1,
            retry_delay_ms: 10,
        },
    );
    queue.set_handler(Arc::new(|_task| {
        Box::pin(async { anyhow::bail!("always broken") })
    }));
    let mut events = queue.subscribe_events();

    let mut new_task = NewTask::new("doomed-work", TaskPriority::Normal);
    new_task.max_retries = 1;
    let task = store.insert_task(new_task).await.unwrap();
    queue.enqueue(task.clone()).await.unwrap();

    let mut retries = 0;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("queue events should arrive")
            .unwrap()
        {
            QueueEvent::Retry { .. } => retries += 1,
            QueueEvent::Failed { task_id, error } => {
                assert_eq!(task_id, task.id);
                assert!(error.contains("always broken"));
                break;
            }
            QueueEvent::Completed { .. } => panic!("task should fail"),
            QueueEvent::Started { .. } => {}
        }
    }
    // retry_count 0 -> one retry; the next failure exhausts the allowance.
    assert_eq!(retries, 1);

    let final_task = store.find_task(&task.id).await.unwrap().unwrap();
    assert_eq!(final_task.status, TaskStatus::Failed);
    assert!(final_task.completed_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_count_never_exceeds_concurrency() {
    let store = store().await;
    let queue = TaskQueue::new(
        store.clone(),
        QueueConfig {
            concurrency: 2,
            retry_delay_ms: 10,
        },
    );
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let queue_ref = Arc::downgrade(&queue);
        let peak = peak.clone();
        queue.set_handler(Arc::new(move |_task| {
            let queue_ref = queue_ref.clone();
            let peak = peak.clone();
            Box::pin(async move {
                if let Some(queue) = queue_ref.upgrade() {
                    peak.fetch_max(queue.active_count(), Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                if let Some(queue) = queue_ref.upgrade() {
                    peak.fetch_max(queue.active_count(), Ordering::SeqCst);
                }
                Ok(ok_output("slow handler done"))
            })
        }));
    }
    let mut events = queue.subscribe_events();

    for i in 0..6 {
        let task = store
            .insert_task(NewTask::new(format!("bulk-{}", i), TaskPriority::Normal))
            .await
            .unwrap();
        queue.enqueue(task).await.unwrap();
    }

    let mut completed = 0;
    while completed < 6 {
        if let QueueEvent::Completed { .. } = tokio::time::timeout(
            Duration::from_secs(10),
            events.recv(),
        )
        .await
        .expect("queue events should arrive")
        .unwrap()
        {
            completed += 1;
        }
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(queue.active_count(), 0);
    assert_eq!(queue.size(), 0);
}

#[tokio::test]
async fn pause_holds_dispatch_until_resume() {
    let store = store().await;
    let queue = TaskQueue::new(store.clone(), QueueConfig::default());
    queue.set_handler(Arc::new(|_task| {
        Box::pin(async { Ok(ok_output("handled after resume")) })
    }));
    let mut events = queue.subscribe_events();

    queue.pause();
    let task = store
        .insert_task(NewTask::new("parked-work", TaskPriority::Normal))
        .await
        .unwrap();
    queue.enqueue(task.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.size(), 1);
    assert_eq!(queue.active_count(), 0);
    let stored = store.find_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);

    queue.resume();
    loop {
        if let QueueEvent::Completed { task_id, .. } = tokio::time::timeout(
            Duration::from_secs(5),
            events.recv(),
        )
        .await
        .expect("queue events should arrive")
        .unwrap()
        {
            assert_eq!(task_id, task.id);
            break;
        }
    }
}

#[tokio::test]
async fn store_status_reflects_running_before_completion_event() {
    let store = store().await;
    let queue = TaskQueue::new(store.clone(), QueueConfig::default());
    let status_during_run = Arc::new(Mutex::new(None));
    {
        let store = store.clone();
        let seen = status_during_run.clone();
        queue.set_handler(Arc::new(move |task| {
            let store = store.clone();
            let seen = seen.clone();
            Box::pin(async move {
                let current = store.find_task(&task.id).await?.unwrap();
                *seen.lock().unwrap() = Some(current.status);
                Ok(ok_output("observed own status"))
            })
        }));
    }
    let mut events = queue.subscribe_events();

    let task = store
        .insert_task(NewTask::new("introspective-work", TaskPriority::Normal))
        .await
        .unwrap();
    queue.enqueue(task).await.unwrap();

    loop {
        if let QueueEvent::Completed { .. } = tokio::time::timeout(
            Duration::from_secs(5),
            events.recv(),
        )
        .await
        .expect("queue events should arrive")
        .unwrap()
        {
            break;
        }
    }
    assert_eq!(*status_during_run.lock().unwrap(), Some(TaskStatus::Running));
}
