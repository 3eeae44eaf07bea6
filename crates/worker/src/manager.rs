use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use taskflow_core::config::{QueueConfig, WorkerConfig};
use taskflow_core::models::keys::{delayed_queue_key, queue_key, task_key, TASK_KEY_PATTERN};
use taskflow_core::{
    DurableStore, SchedulerResult, Task, TaskHandler, TaskOptions, TaskPriority, TaskStatus,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::queue::TaskQueue;
use crate::worker::{TaskWorker, WorkerSettings, WorkerStats};

/// 单个队列的积压情况
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub delayed: usize,
}

/// 任务统计，按存储中的任务记录计算
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total_tasks: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retrying: usize,
    /// completed + failed
    pub total_runs: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub success_rate: f64,
    pub queues: BTreeMap<String, QueueStats>,
    pub running_workers: usize,
}

struct WorkerHandle {
    worker: Arc<TaskWorker>,
    handle: JoinHandle<()>,
}

/// 队列与Worker池的管理入口
///
/// 队列在首次使用时创建，所有队列共享同一个存储。
pub struct TaskManager {
    store: Arc<dyn DurableStore>,
    queue_config: QueueConfig,
    worker_settings: WorkerSettings,
    queues: RwLock<HashMap<String, Arc<TaskQueue>>>,
    workers: Mutex<Vec<WorkerHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    hostname: String,
    next_worker: AtomicUsize,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue_config: QueueConfig,
        worker_config: &WorkerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            queue_config,
            worker_settings: WorkerSettings::from(worker_config),
            queues: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            next_worker: AtomicUsize::new(1),
        }
    }

    /// 获取队列，不存在时创建
    pub async fn queue(&self, queue_name: &str) -> Arc<TaskQueue> {
        if let Some(queue) = self.queues.read().await.get(queue_name) {
            return Arc::clone(queue);
        }

        let mut queues = self.queues.write().await;
        Arc::clone(queues.entry(queue_name.to_string()).or_insert_with(|| {
            info!("创建队列: {}", queue_name);
            Arc::new(TaskQueue::new(
                queue_name,
                Arc::clone(&self.store),
                &self.queue_config,
            ))
        }))
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn register_handler(
        &self,
        queue_name: &str,
        task_name: &str,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.queue(queue_name)
            .await
            .register_handler(task_name, handler)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_task(
        &self,
        queue_name: &str,
        task_name: &str,
        payload: Value,
        priority: TaskPriority,
        max_retries: u32,
        retry_delay: u64,
        timeout: u64,
    ) -> SchedulerResult<String> {
        self.queue(queue_name)
            .await
            .enqueue(task_name, payload, priority, max_retries, retry_delay, timeout)
            .await
    }

    /// 使用给定参数入队，未指定时取队列默认值见 [`TaskQueue::defaults`]
    pub async fn enqueue_task_with(
        &self,
        queue_name: &str,
        task_name: &str,
        payload: Value,
        options: Option<TaskOptions>,
    ) -> SchedulerResult<String> {
        let queue = self.queue(queue_name).await;
        let options = options.unwrap_or_else(|| queue.defaults().clone());
        queue.enqueue_with(task_name, payload, options).await
    }

    pub async fn get_task(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        match self.store.get(&task_key(task_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// 取消任务，任务不存在或已结束时返回 false
    pub async fn cancel_task(&self, task_id: &str) -> SchedulerResult<bool> {
        let Some(task) = self.get_task(task_id).await? else {
            return Ok(false);
        };
        self.queue(&task.queue_name).await.cancel(task_id).await
    }

    /// 在队列上启动 `count` 个Worker，返回Worker ID
    pub async fn start_workers(&self, queue_name: &str, count: usize) -> Vec<String> {
        let queue = self.queue(queue_name).await;
        let mut workers = self.workers.lock().await;
        let mut started = Vec::with_capacity(count);

        for _ in 0..count {
            let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
            let worker_id = format!("{}-{}-{}", self.hostname, queue_name, index);
            let worker = Arc::new(TaskWorker::new(
                worker_id.clone(),
                Arc::clone(&queue),
                self.worker_settings.clone(),
            ));

            let shutdown_rx = self.shutdown_tx.subscribe();
            let runner = Arc::clone(&worker);
            let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

            workers.push(WorkerHandle { worker, handle });
            started.push(worker_id);
        }

        info!("队列 {} 启动 {} 个Worker", queue_name, count);
        started
    }

    /// 通知所有Worker停止并等待其退出
    pub async fn stop_workers(&self) {
        let handles: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }

        info!("停止 {} 个Worker", handles.len());
        let _ = self.shutdown_tx.send(());

        for WorkerHandle { worker, handle } in handles {
            if let Err(e) = handle.await {
                warn!("Worker {} 退出异常: {}", worker.worker_id(), e);
            }
        }
    }

    pub async fn running_worker_count(&self) -> usize {
        self.workers
            .lock()
            .await
            .iter()
            .filter(|w| !w.handle.is_finished())
            .count()
    }

    pub async fn worker_stats(&self) -> Vec<(String, WorkerStats)> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|w| (w.worker.worker_id().to_string(), w.worker.stats()))
            .collect()
    }

    /// 直接读取列表长度，不为只存在于存储中的队列创建实例
    async fn queue_stats(&self, queue_name: &str) -> SchedulerResult<QueueStats> {
        let mut pending = 0;
        for priority in TaskPriority::DRAIN_ORDER {
            pending += self
                .store
                .list_length(&queue_key(queue_name, priority))
                .await?;
        }
        let delayed = self
            .store
            .list_length(&delayed_queue_key(queue_name))
            .await?;
        Ok(QueueStats { pending, delayed })
    }

    /// 扫描存储中的全部任务记录计算统计
    pub async fn get_stats(&self) -> SchedulerResult<TaskStats> {
        let mut stats = TaskStats::default();
        let mut queue_names: Vec<String> = self.queue_names().await;

        for key in self.store.keys(TASK_KEY_PATTERN).await? {
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            let task: Task = match serde_json::from_str(&json) {
                Ok(task) => task,
                Err(e) => {
                    warn!("任务记录 {} 无法解析: {}", key, e);
                    continue;
                }
            };

            stats.total_tasks += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Retrying => stats.retrying += 1,
            }
            if !queue_names.contains(&task.queue_name) {
                queue_names.push(task.queue_name);
            }
        }

        stats.success_count = stats.completed;
        stats.failure_count = stats.failed;
        stats.total_runs = stats.completed + stats.failed;
        stats.success_rate = if stats.total_runs == 0 {
            0.0
        } else {
            stats.completed as f64 / stats.total_runs as f64
        };

        for name in queue_names {
            let queue_stats = self.queue_stats(&name).await?;
            stats.queues.insert(name, queue_stats);
        }
        stats.running_workers = self.running_worker_count().await;

        Ok(stats)
    }
}
