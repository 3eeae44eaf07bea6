use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use taskflow_core::config::WorkerConfig;
use taskflow_core::{SchedulerError, SchedulerResult, Task, TaskHandler};
use taskflow_infrastructure::{MetricsCollector, StructuredLogger};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::queue::{FailureOutcome, TaskQueue};

/// Worker运行参数
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub store_backoff_initial: Duration,
    pub store_backoff_max: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            store_backoff_initial: Duration::from_millis(config.store_backoff_initial_ms),
            store_backoff_max: Duration::from_millis(config.store_backoff_max_ms),
        }
    }
}

/// Worker执行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    /// 执行结束时任务已被取消，结果未记录
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    discarded: AtomicU64,
}

impl WorkerCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// 停止信号，收到后保持触发状态
struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
    triggered: bool,
}

impl ShutdownSignal {
    fn new(rx: broadcast::Receiver<()>) -> Self {
        Self {
            rx,
            triggered: false,
        }
    }

    fn is_triggered(&mut self) -> bool {
        if !self.triggered && !matches!(self.rx.try_recv(), Err(TryRecvError::Empty)) {
            self.triggered = true;
        }
        self.triggered
    }

    /// 睡眠指定时长，期间收到停止信号时提前返回 true
    async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.rx.recv() => {
                self.triggered = true;
                true
            }
        }
    }
}

/// 单个队列上的执行循环
///
/// 每轮先把到期的重试任务移回队列，再取一个任务执行。处理函数在独立的
/// tokio 任务中运行并受 `timeout` 限制，panic 视为执行错误。
pub struct TaskWorker {
    worker_id: String,
    queue: Arc<TaskQueue>,
    settings: WorkerSettings,
    counters: Arc<WorkerCounters>,
    metrics: MetricsCollector,
}

impl TaskWorker {
    pub fn new(worker_id: impl Into<String>, queue: Arc<TaskQueue>, settings: WorkerSettings) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            settings,
            counters: Arc::new(WorkerCounters::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// 运行直到收到停止信号，正在执行的任务会先完成
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        let mut signal = ShutdownSignal::new(shutdown_rx);
        let mut store_backoff = self.settings.store_backoff_initial;
        info!("Worker {} 开始处理队列 {}", self.worker_id, self.queue.name());

        while !signal.is_triggered() {
            match self.poll_once(&mut signal).await {
                Ok(true) => {
                    store_backoff = self.settings.store_backoff_initial;
                }
                Ok(false) => {
                    store_backoff = self.settings.store_backoff_initial;
                    if signal.sleep(self.settings.poll_interval).await {
                        break;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Worker {} 访问存储失败，{}ms后重试: {}",
                        self.worker_id,
                        store_backoff.as_millis(),
                        e
                    );
                    if signal.sleep(store_backoff).await {
                        break;
                    }
                    store_backoff = (store_backoff * 2).min(self.settings.store_backoff_max);
                }
                Err(e) => {
                    error!("Worker {} 轮询失败: {}", self.worker_id, e);
                    if signal.sleep(self.settings.poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!("Worker {} 已停止", self.worker_id);
    }

    /// 处理至多一个任务，队列为空时返回 false
    async fn poll_once(&self, signal: &mut ShutdownSignal) -> SchedulerResult<bool> {
        self.queue.promote_due_retries().await?;

        let Some(task) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        self.process(task, signal).await;
        Ok(true)
    }

    async fn process(&self, task: Task, signal: &mut ShutdownSignal) {
        StructuredLogger::log_task_started(
            &task.task_id,
            &task.task_name,
            &self.worker_id,
            task.attempts(),
        );
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let outcome = match self.queue.handler(&task.task_name).await {
            Some(handler) => Self::execute(handler, task.payload.clone(), task.timeout).await,
            None => Err(SchedulerError::HandlerNotFound {
                name: task.task_name.clone(),
            }),
        };
        let elapsed = started.elapsed();

        self.record_outcome(&task, outcome, elapsed, signal).await;
    }

    /// 在独立任务中执行处理函数并施加超时
    async fn execute(
        handler: Arc<dyn TaskHandler>,
        payload: Value,
        timeout_seconds: u64,
    ) -> SchedulerResult<Value> {
        let mut join = tokio::spawn(async move { handler.handle(payload).await });

        match tokio::time::timeout(Duration::from_secs(timeout_seconds), &mut join).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(SchedulerError::ExecutionError(format!("{e:#}"))),
            Ok(Err(join_error)) => Err(SchedulerError::ExecutionError(format!(
                "处理函数异常退出: {join_error}"
            ))),
            Err(_) => {
                join.abort();
                Err(SchedulerError::ExecutionTimeout {
                    seconds: timeout_seconds,
                })
            }
        }
    }

    /// 写回执行结果，存储不可用时退避重试直到成功或收到停止信号
    async fn record_outcome(
        &self,
        task: &Task,
        outcome: SchedulerResult<Value>,
        elapsed: Duration,
        signal: &mut ShutdownSignal,
    ) {
        let mut backoff = self.settings.store_backoff_initial;

        loop {
            let written = match &outcome {
                Ok(value) => self
                    .queue
                    .complete(&task.task_id, value.clone())
                    .await
                    .map(|applied| {
                        if applied {
                            self.on_completed(task, elapsed);
                        } else {
                            self.on_discarded(task);
                        }
                    }),
                Err(e) => self
                    .queue
                    .fail(&task.task_id, &e.to_string())
                    .await
                    .map(|result| self.on_failed(task, e, result, elapsed)),
            };

            match written {
                Ok(()) => return,
                Err(e) if e.is_transient() => {
                    warn!(
                        "写回任务 {} 结果失败，{}ms后重试: {}",
                        task.task_id,
                        backoff.as_millis(),
                        e
                    );
                    if signal.sleep(backoff).await {
                        error!("收到停止信号，任务 {} 的执行结果未能写回", task.task_id);
                        return;
                    }
                    backoff = (backoff * 2).min(self.settings.store_backoff_max);
                }
                Err(e) => {
                    error!("写回任务 {} 结果失败: {}", task.task_id, e);
                    return;
                }
            }
        }
    }

    fn on_completed(&self, task: &Task, elapsed: Duration) {
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_task_execution(
            self.queue.name(),
            &task.task_name,
            "completed",
            elapsed.as_secs_f64(),
        );
        StructuredLogger::log_task_completed(
            &task.task_id,
            &task.task_name,
            &self.worker_id,
            elapsed.as_millis() as u64,
        );
    }

    fn on_discarded(&self, task: &Task) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        debug!("任务 {} 执行期间已被取消，结果丢弃", task.task_id);
    }

    fn on_failed(
        &self,
        task: &Task,
        error: &SchedulerError,
        outcome: FailureOutcome,
        elapsed: Duration,
    ) {
        let error_type = match error {
            SchedulerError::ExecutionTimeout { .. } => "timeout",
            SchedulerError::HandlerNotFound { .. } => "handler_not_found",
            _ => "execution_error",
        };
        self.metrics
            .record_task_failure(self.queue.name(), &task.task_name, error_type);

        let status = match outcome {
            FailureOutcome::Retrying { .. } => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                "retrying"
            }
            FailureOutcome::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                "failed"
            }
            FailureOutcome::Skipped => {
                self.on_discarded(task);
                "cancelled"
            }
        };
        self.metrics.record_task_execution(
            self.queue.name(),
            &task.task_name,
            status,
            elapsed.as_secs_f64(),
        );
    }
}
