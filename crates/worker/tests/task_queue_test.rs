use std::sync::Arc;

use serde_json::{json, Value};
use taskflow_core::config::QueueConfig;
use taskflow_core::{DurableStore, SchedulerError, TaskOptions, TaskPriority, TaskStatus};
use taskflow_infrastructure::InMemoryStore;
use taskflow_worker::{FailureOutcome, TaskQueue};

fn queue_with_store() -> (TaskQueue, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let config = QueueConfig {
        retry_delay_seconds: 0,
        ..QueueConfig::default()
    };
    let queue = TaskQueue::new("default", store.clone() as Arc<dyn DurableStore>, &config);
    (queue, store)
}

async fn queue_with_echo() -> TaskQueue {
    let (queue, _) = queue_with_store();
    queue
        .register_handler("echo", Arc::new(|payload: Value| async move { anyhow::Ok(payload) }))
        .await;
    queue
}

fn options(priority: TaskPriority) -> TaskOptions {
    TaskOptions::default().priority(priority).retry_delay(0)
}

#[tokio::test]
async fn test_enqueue_requires_registered_handler() {
    let (queue, store) = queue_with_store();
    let err = queue
        .enqueue_with("missing", json!({}), TaskOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::HandlerNotFound { name } if name == "missing"));
    assert!(store.keys("*").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_round_trip_preserves_identity_and_payload() {
    let queue = queue_with_echo().await;
    let payload = json!({"to": "ops@example.com", "attempt": [1, 2, 3]});
    let task_id = queue
        .enqueue_with("echo", payload.clone(), TaskOptions::default())
        .await
        .unwrap();

    let task = queue.dequeue().await.unwrap().expect("应取到任务");
    assert_eq!(task.task_id, task_id);
    assert_eq!(task.task_name, "echo");
    assert_eq!(task.payload, payload);
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.started_at.is_some());
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let queue = queue_with_echo().await;
    let first_high = queue
        .enqueue_with("echo", json!(1), options(TaskPriority::High))
        .await
        .unwrap();
    let low = queue
        .enqueue_with("echo", json!(2), options(TaskPriority::Low))
        .await
        .unwrap();
    let second_high = queue
        .enqueue_with("echo", json!(3), options(TaskPriority::High))
        .await
        .unwrap();
    let critical = queue
        .enqueue_with("echo", json!(4), options(TaskPriority::Critical))
        .await
        .unwrap();

    assert_eq!(queue.size().await.unwrap(), 4);

    let mut order = Vec::new();
    while let Some(task) = queue.dequeue().await.unwrap() {
        order.push(task.task_id);
    }
    assert_eq!(order, vec![critical, first_high, second_high, low]);
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancelled_pending_task_is_never_dequeued() {
    let queue = queue_with_echo().await;
    let task_id = queue
        .enqueue_with("echo", json!(null), TaskOptions::default())
        .await
        .unwrap();

    assert!(queue.cancel(&task_id).await.unwrap());
    assert!(!queue.cancel(&task_id).await.unwrap());
    assert!(queue.dequeue().await.unwrap().is_none());

    let task = queue.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn test_complete_sets_result_and_progress() {
    let queue = queue_with_echo().await;
    let task_id = queue
        .enqueue_with("echo", json!(null), TaskOptions::default())
        .await
        .unwrap();
    queue.dequeue().await.unwrap().unwrap();

    assert!(queue.update_progress(&task_id, 40).await.unwrap());
    assert!(queue.complete(&task_id, json!({"rows": 10})).await.unwrap());

    let task = queue.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.result, Some(json!({"rows": 10})));
    assert!(!queue.complete(&task_id, json!(null)).await.unwrap());
}

#[tokio::test]
async fn test_retry_cycle_through_delayed_list() {
    let queue = queue_with_echo().await;
    let task_id = queue
        .enqueue_with("echo", json!(null), TaskOptions::default().max_retries(2).retry_delay(0))
        .await
        .unwrap();

    for expected_retry in 1..=2 {
        let task = queue.dequeue().await.unwrap().expect("应取到任务");
        assert_eq!(task.retry_count, expected_retry - 1);

        let outcome = queue.fail(&task_id, "boom").await.unwrap();
        assert!(matches!(
            outcome,
            FailureOutcome::Retrying { retry_count, .. } if retry_count == expected_retry
        ));
        assert_eq!(queue.delayed_size().await.unwrap(), 1);
        assert!(queue.dequeue().await.unwrap().is_none());

        assert_eq!(queue.promote_due_retries().await.unwrap(), 1);
    }

    queue.dequeue().await.unwrap().expect("第三次执行");
    assert_eq!(queue.fail(&task_id, "boom").await.unwrap(), FailureOutcome::Failed);

    let task = queue.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_not_yet_due_retry_stays_delayed() {
    let (queue, _) = queue_with_store();
    queue
        .register_handler("echo", Arc::new(|payload: Value| async move { anyhow::Ok(payload) }))
        .await;
    let task_id = queue
        .enqueue_with("echo", json!(null), TaskOptions::default().retry_delay(3600))
        .await
        .unwrap();
    queue.dequeue().await.unwrap().unwrap();
    queue.fail(&task_id, "later").await.unwrap();

    assert_eq!(queue.promote_due_retries().await.unwrap(), 0);
    assert_eq!(queue.delayed_size().await.unwrap(), 1);

    assert!(queue.cancel(&task_id).await.unwrap());
    assert_eq!(queue.promote_due_retries().await.unwrap(), 0);
    assert_eq!(queue.delayed_size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_fail_after_cancel_is_skipped() {
    let queue = queue_with_echo().await;
    let task_id = queue
        .enqueue_with("echo", json!(null), TaskOptions::default())
        .await
        .unwrap();
    queue.dequeue().await.unwrap().unwrap();
    assert!(queue.cancel(&task_id).await.unwrap());

    assert_eq!(queue.fail(&task_id, "late").await.unwrap(), FailureOutcome::Skipped);
    let task = queue.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.error_message.is_none());
}

#[tokio::test]
async fn test_missing_record_is_dropped_on_dequeue() {
    let (queue, store) = queue_with_store();
    queue
        .register_handler("echo", Arc::new(|payload: Value| async move { anyhow::Ok(payload) }))
        .await;
    store
        .list_push_left("queue:default:normal", "ghost")
        .await
        .unwrap();

    assert!(queue.dequeue().await.unwrap().is_none());
    assert_eq!(queue.size().await.unwrap(), 0);
}
