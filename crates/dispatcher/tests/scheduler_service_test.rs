use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use taskflow_core::models::{CronFields, IntervalConfig, JobArguments, JobStatus};
use taskflow_core::{DurableStore, JobFunction, ScheduledJob, SchedulerError};
use taskflow_dispatcher::{JobOptions, SchedulerService, SchedulerSettings};
use taskflow_infrastructure::InMemoryStore;
use tokio::sync::Semaphore;

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        tick_interval: Duration::from_millis(20),
        ..SchedulerSettings::default()
    }
}

fn service_on(store: Arc<dyn DurableStore>) -> Arc<SchedulerService> {
    Arc::new(SchedulerService::new(store, settings()))
}

fn counting_function(counter: Arc<AtomicU32>) -> Arc<dyn JobFunction> {
    Arc::new(move |arguments: JobArguments| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(json!({"args": arguments.args}))
        }
    })
}

/// 在信号量放行之前一直阻塞的作业函数
fn gated_function(gate: Arc<Semaphore>, counter: Arc<AtomicU32>) -> Arc<dyn JobFunction> {
    Arc::new(move |_arguments: JobArguments| {
        let gate = Arc::clone(&gate);
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _permit = gate.acquire().await?;
            anyhow::Ok(Value::Null)
        }
    })
}

async fn wait_for_job<F>(service: &SchedulerService, job_id: &str, predicate: F) -> ScheduledJob
where
    F: Fn(&ScheduledJob) -> bool,
{
    for _ in 0..300 {
        let job = service.get_job(job_id).await.unwrap().unwrap();
        if predicate(&job) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = service.get_job(job_id).await.unwrap().unwrap();
    panic!("作业 {} 未达到预期状态，当前 {:?}", job_id, job);
}

async fn wait_for_count(counter: &AtomicU32, expected: u32) {
    for _ in 0..300 {
        if counter.load(Ordering::SeqCst) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("调用次数未达到 {}", expected);
}

#[tokio::test]
async fn test_unknown_function_is_rejected() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    let err = service
        .add_interval_job(
            "ghost",
            "missing",
            IntervalConfig::seconds(5),
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::HandlerNotFound { .. }));
    assert!(service.get_all_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_trigger_that_never_fires_is_rejected() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    service
        .register_function("noop", counting_function(Arc::new(AtomicU32::new(0))))
        .await;

    let err = service
        .add_cron_job(
            "past",
            "noop",
            CronFields::default().year(2020),
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTrigger(_)));

    let err = service
        .add_date_job(
            "yesterday",
            "noop",
            Utc::now() - chrono::Duration::days(1),
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTrigger(_)));
}

#[tokio::test]
async fn test_interval_job_runs_and_advances() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    let counter = Arc::new(AtomicU32::new(0));
    service
        .register_function("count", counting_function(Arc::clone(&counter)))
        .await;

    let job_id = service
        .add_interval_job(
            "heartbeat",
            "count",
            IntervalConfig::seconds(5),
            JobArguments::new(vec![json!(1)], Default::default()),
            JobOptions::default(),
        )
        .await
        .unwrap();

    let job = service.get_job(&job_id).await.unwrap().unwrap();
    let first = job.next_run.unwrap();
    assert_eq!(first, job.created_at + chrono::Duration::seconds(5));
    assert_eq!(
        service.next_fire_times(&job_id, 3).await.unwrap(),
        vec![
            first,
            first + chrono::Duration::seconds(5),
            first + chrono::Duration::seconds(10)
        ]
    );

    // 未到期不触发
    assert_eq!(
        service
            .run_pending_once(first - chrono::Duration::seconds(1))
            .await
            .unwrap(),
        0
    );

    assert_eq!(service.run_pending_once(first).await.unwrap(), 1);
    let job = wait_for_job(&service, &job_id, |job| job.success_count == 1).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(job.run_count, 1);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_run, Some(first));
    assert_eq!(job.next_run, Some(first + chrono::Duration::seconds(5)));
}

#[tokio::test]
async fn test_date_job_fires_at_most_once_across_restart() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
    let counter = Arc::new(AtomicU32::new(0));
    let service = service_on(Arc::clone(&store));
    service
        .register_function("count", counting_function(Arc::clone(&counter)))
        .await;

    let run_date = Utc::now() + chrono::Duration::hours(1);
    let job_id = service
        .add_date_job(
            "once",
            "count",
            run_date,
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(service.run_pending_once(run_date).await.unwrap(), 1);
    let job = wait_for_job(&service, &job_id, |job| job.status == JobStatus::Completed).await;
    assert_eq!(job.next_run, None);
    assert_eq!(job.success_count, 1);

    assert_eq!(
        service
            .run_pending_once(run_date + chrono::Duration::seconds(1))
            .await
            .unwrap(),
        0
    );

    // 新进程使用同一个存储
    let restarted = service_on(Arc::clone(&store));
    restarted
        .register_function("count", counting_function(Arc::clone(&counter)))
        .await;
    assert_eq!(restarted.recover_interrupted_jobs().await.unwrap(), 0);
    assert_eq!(
        restarted
            .run_pending_once(run_date + chrono::Duration::seconds(2))
            .await
            .unwrap(),
        0
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_interrupted_date_job_is_not_refired() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let counter = Arc::new(AtomicU32::new(0));

    let crashed = service_on(Arc::clone(&store));
    crashed
        .register_function("slow", gated_function(Arc::clone(&gate), Arc::clone(&counter)))
        .await;
    let run_date = Utc::now() + chrono::Duration::hours(1);
    let job_id = crashed
        .add_date_job(
            "once",
            "slow",
            run_date,
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(crashed.run_pending_once(run_date).await.unwrap(), 1);
    wait_for_count(&counter, 1).await;
    assert_eq!(
        crashed.get_job(&job_id).await.unwrap().unwrap().status,
        JobStatus::Running
    );

    // 模拟进程崩溃后重启：新的调度器接管同一个存储
    let restarted = service_on(Arc::clone(&store));
    restarted
        .register_function("slow", gated_function(Arc::clone(&gate), Arc::clone(&counter)))
        .await;
    assert_eq!(restarted.recover_interrupted_jobs().await.unwrap(), 1);

    let job = restarted.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("interrupted"));
    assert_eq!(job.failure_count, 1);
    assert_eq!(job.unfinished_runs(), 0);

    assert_eq!(
        restarted
            .run_pending_once(run_date + chrono::Duration::seconds(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_max_instances_prevents_overlap() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    let gate = Arc::new(Semaphore::new(0));
    let counter = Arc::new(AtomicU32::new(0));
    service
        .register_function("slow", gated_function(Arc::clone(&gate), Arc::clone(&counter)))
        .await;

    let job_id = service
        .add_interval_job(
            "sync",
            "slow",
            IntervalConfig::seconds(1),
            JobArguments::default(),
            JobOptions::default().max_instances(1),
        )
        .await
        .unwrap();

    let first = service.get_job(&job_id).await.unwrap().unwrap().next_run.unwrap();
    assert_eq!(service.run_pending_once(first).await.unwrap(), 1);

    let second = first + chrono::Duration::seconds(1);
    assert_eq!(service.run_pending_once(second).await.unwrap(), 0);
    let job = service.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.run_count, 1);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.next_run, Some(second + chrono::Duration::seconds(1)));

    gate.add_permits(1);
    let job = wait_for_job(&service, &job_id, |job| job.status == JobStatus::Pending).await;
    assert_eq!(job.success_count, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let third = job.next_run.unwrap();
    assert_eq!(service.run_pending_once(third).await.unwrap(), 1);
    gate.add_permits(1);
    wait_for_job(&service, &job_id, |job| job.success_count == 2).await;
}

#[tokio::test]
async fn test_misfire_skips_and_advances() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    let counter = Arc::new(AtomicU32::new(0));
    service
        .register_function("count", counting_function(Arc::clone(&counter)))
        .await;

    let job_id = service
        .add_interval_job(
            "report",
            "count",
            IntervalConfig::seconds(60),
            JobArguments::default(),
            JobOptions::default().misfire_grace_time(5),
        )
        .await
        .unwrap();
    let scheduled = service.get_job(&job_id).await.unwrap().unwrap().next_run.unwrap();

    let late = scheduled + chrono::Duration::seconds(10);
    assert_eq!(service.run_pending_once(late).await.unwrap(), 0);
    let job = service.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.run_count, 0);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.next_run, Some(scheduled + chrono::Duration::seconds(60)));

    let run_date = Utc::now() + chrono::Duration::minutes(10);
    let date_id = service
        .add_date_job(
            "one-shot",
            "count",
            run_date,
            JobArguments::default(),
            JobOptions::default().misfire_grace_time(5),
        )
        .await
        .unwrap();
    service
        .run_pending_once(run_date + chrono::Duration::seconds(30))
        .await
        .unwrap();
    let job = service.get_job(&date_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Missed);
    assert_eq!(job.run_count, 0);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_paused_job_never_fires() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    let counter = Arc::new(AtomicU32::new(0));
    service
        .register_function("count", counting_function(Arc::clone(&counter)))
        .await;

    let job_id = service
        .add_interval_job(
            "poll",
            "count",
            IntervalConfig::seconds(5),
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap();
    let next_run = service.get_job(&job_id).await.unwrap().unwrap().next_run.unwrap();

    assert!(service.pause_job(&job_id).await.unwrap());
    assert!(!service.pause_job(&job_id).await.unwrap());
    assert_eq!(service.run_pending_once(next_run).await.unwrap(), 0);
    assert_eq!(
        service.get_job(&job_id).await.unwrap().unwrap().status,
        JobStatus::Paused
    );

    let before_resume = Utc::now();
    assert!(service.resume_job(&job_id).await.unwrap());
    let job = service.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.next_run.unwrap() > before_resume);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    let err = service.pause_job("missing").await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound { .. }));
}

#[tokio::test]
async fn test_failures_are_recorded() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    service
        .register_function(
            "broken",
            Arc::new(|_arguments: JobArguments| async move {
                Err::<Value, _>(anyhow::anyhow!("磁盘已满"))
            }),
        )
        .await;
    service
        .register_function(
            "panics",
            Arc::new(|_arguments: JobArguments| async move {
                if true {
                    panic!("作业崩溃");
                }
                anyhow::Ok(Value::Null)
            }),
        )
        .await;

    let run_date = Utc::now() + chrono::Duration::hours(1);
    let broken = service
        .add_date_job("broken", "broken", run_date, JobArguments::default(), JobOptions::default())
        .await
        .unwrap();
    let panics = service
        .add_date_job("panics", "panics", run_date, JobArguments::default(), JobOptions::default())
        .await
        .unwrap();

    assert_eq!(service.run_pending_once(run_date).await.unwrap(), 2);

    let job = wait_for_job(&service, &broken, |job| job.status == JobStatus::Failed).await;
    assert_eq!(job.failure_count, 1);
    assert!(job.last_error.unwrap().contains("磁盘已满"));

    let job = wait_for_job(&service, &panics, |job| job.status == JobStatus::Failed).await;
    assert_eq!(job.failure_count, 1);

    let stats = service.get_stats().await.unwrap();
    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.by_status["FAILED"], 2);
    assert_eq!(stats.total_runs, 2);
    assert_eq!(stats.total_failures, 2);
    assert_eq!(stats.success_rate, 0.0);
}

#[tokio::test]
async fn test_job_removed_mid_flight_is_not_recreated() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    let gate = Arc::new(Semaphore::new(0));
    service
        .register_function(
            "slow",
            gated_function(Arc::clone(&gate), Arc::new(AtomicU32::new(0))),
        )
        .await;

    let job_id = service
        .add_interval_job(
            "cleanup",
            "slow",
            IntervalConfig::seconds(30),
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap();
    let next_run = service.get_job(&job_id).await.unwrap().unwrap().next_run.unwrap();
    assert_eq!(service.run_pending_once(next_run).await.unwrap(), 1);

    assert!(service.remove_job(&job_id).await.unwrap());
    gate.add_permits(1);
    service.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.get_job(&job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_tick_loop_fires_jobs() {
    let service = service_on(Arc::new(InMemoryStore::new()));
    let counter = Arc::new(AtomicU32::new(0));
    service
        .register_function("count", counting_function(Arc::clone(&counter)))
        .await;
    let job_id = service
        .add_interval_job(
            "tick",
            "count",
            IntervalConfig::seconds(1),
            JobArguments::default(),
            JobOptions::default(),
        )
        .await
        .unwrap();

    service.start().await.unwrap();
    assert!(service.is_running().await);
    wait_for_job(&service, &job_id, |job| job.success_count >= 1).await;
    service.stop().await;
    assert!(!service.is_running().await);

    assert!(counter.load(Ordering::SeqCst) >= 1);
}
