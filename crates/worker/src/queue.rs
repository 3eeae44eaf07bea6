use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskflow_core::config::QueueConfig;
use taskflow_core::models::keys::{delayed_queue_key, queue_key, task_key};
use taskflow_core::{
    DurableStore, HandlerRegistry, SchedulerError, SchedulerResult, Task, TaskHandler,
    TaskOptions, TaskPriority, TaskStatus,
};
use taskflow_infrastructure::{MetricsCollector, StructuredLogger};
use tracing::{debug, error, info, warn};

/// 列表压入遇到存储故障时的最大尝试次数
const PUSH_ATTEMPTS: u32 = 3;
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// 重试退避策略
///
/// 第 n 次重试（从1开始）的延迟为 `retry_delay * multiplier^(n-1)`，
/// 不超过 `max_delay`，再叠加 `[0, jitter_factor)` 比例的随机抖动。
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_secs(config.max_retry_delay_seconds),
            jitter_factor: config.jitter_factor,
        }
    }

    pub fn delay(&self, retry_delay_seconds: u64, retry_number: u32) -> Duration {
        let exponent = retry_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = retry_delay_seconds as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * rand::random::<f64>()
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// `fail` 的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// 进入延迟队列，等待 `retry_at` 后重新入队
    Retrying {
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    /// 重试次数耗尽
    Failed,
    /// 任务已不在 RUNNING 状态（例如执行中被取消），未做修改
    Skipped,
}

/// 单个命名队列
///
/// 每个优先级对应一个列表 `queue:{name}:{priority}`，左进右出保证
/// 同一优先级内先进先出；等待重试的任务ID放在 `queue:{name}:delayed`。
pub struct TaskQueue {
    name: String,
    store: Arc<dyn DurableStore>,
    handlers: HandlerRegistry,
    defaults: TaskOptions,
    backoff: BackoffPolicy,
    result_ttl: Duration,
    metrics: MetricsCollector,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn DurableStore>, config: &QueueConfig) -> Self {
        Self {
            name: name.into(),
            store,
            handlers: HandlerRegistry::new(),
            defaults: config.task_options(),
            backoff: BackoffPolicy::from_config(config),
            result_ttl: Duration::from_secs(config.result_ttl_seconds),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 入队时未指定参数的默认值
    pub fn defaults(&self) -> &TaskOptions {
        &self.defaults
    }

    /// 注册处理函数，重复注册以最后一次为准
    pub async fn register_handler(&self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_name = task_name.into();
        debug!("队列 {} 注册处理函数: {}", self.name, task_name);
        self.handlers.register(task_name, handler).await;
    }

    pub async fn handler(&self, task_name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_name).await
    }

    pub async fn handler_names(&self) -> Vec<String> {
        self.handlers.names().await
    }

    pub async fn enqueue(
        &self,
        task_name: &str,
        payload: Value,
        priority: TaskPriority,
        max_retries: u32,
        retry_delay: u64,
        timeout: u64,
    ) -> SchedulerResult<String> {
        let options = TaskOptions {
            priority,
            max_retries,
            retry_delay,
            timeout,
        };
        self.enqueue_with(task_name, payload, options).await
    }

    /// 按给定参数入队，返回任务ID
    ///
    /// 先写任务记录再把ID压入优先级列表，出队方总能读到记录。
    pub async fn enqueue_with(
        &self,
        task_name: &str,
        payload: Value,
        options: TaskOptions,
    ) -> SchedulerResult<String> {
        if !self.handlers.contains(task_name).await {
            return Err(SchedulerError::HandlerNotFound {
                name: task_name.to_string(),
            });
        }
        if options.timeout == 0 {
            return Err(SchedulerError::InvalidTaskParams(
                "任务超时时间必须大于0".to_string(),
            ));
        }

        let task = Task::new(&self.name, task_name, payload, &options);
        self.save(&task).await?;
        self.push_id(&queue_key(&self.name, task.priority), &task.task_id)
            .await?;

        self.metrics.record_task_enqueued(&self.name, task_name);
        StructuredLogger::log_task_enqueued(
            &task.task_id,
            task_name,
            &self.name,
            task.priority.as_str(),
        );
        Ok(task.task_id)
    }

    /// 取出下一个待执行的任务并标记为 RUNNING
    ///
    /// 高优先级列表先取空；记录缺失或已不是 PENDING（例如已取消）的ID直接丢弃。
    /// 弹出ID后访问存储失败时，ID会被放回原列表。
    pub async fn dequeue(&self) -> SchedulerResult<Option<Task>> {
        for priority in TaskPriority::DRAIN_ORDER {
            let list = queue_key(&self.name, priority);

            while let Some(task_id) = self.store.list_pop_right(&list).await? {
                let mut task = match self.load(&task_id).await {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        debug!("任务记录不存在，丢弃: {}", task_id);
                        continue;
                    }
                    Err(e) if e.is_transient() => {
                        self.requeue_id(&list, &task_id).await;
                        return Err(e);
                    }
                    Err(e) => {
                        warn!("任务记录无法解析，丢弃 {}: {}", task_id, e);
                        continue;
                    }
                };

                if task.status != TaskStatus::Pending {
                    debug!("任务 {} 状态为 {}，跳过", task_id, task.status);
                    continue;
                }

                task.mark_running(Utc::now())?;
                if let Err(e) = self.save(&task).await {
                    self.requeue_id(&list, &task_id).await;
                    return Err(e);
                }
                return Ok(Some(task));
            }
        }

        Ok(None)
    }

    /// 标记任务成功，任务已不在 RUNNING 状态时返回 false
    pub async fn complete(&self, task_id: &str, result: Value) -> SchedulerResult<bool> {
        let mut task = self.require(task_id).await?;
        if task.status != TaskStatus::Running {
            debug!("任务 {} 状态为 {}，忽略完成结果", task_id, task.status);
            return Ok(false);
        }

        task.mark_completed(result, Utc::now())?;
        self.save(&task).await?;
        Ok(true)
    }

    /// 记录一次失败：还有重试次数时进入延迟队列，否则标记为 FAILED
    ///
    /// 对已处于 RETRYING 的任务重复调用会再次把ID压入延迟列表，
    /// 上一次调用在写入记录后压入失败时由此补齐。延迟列表中的重复ID
    /// 在重新入队时被丢弃。
    pub async fn fail(&self, task_id: &str, error_message: &str) -> SchedulerResult<FailureOutcome> {
        let mut task = self.require(task_id).await?;
        if task.status == TaskStatus::Retrying {
            self.push_id(&delayed_queue_key(&self.name), task_id).await?;
            let retry_at = task.retry_at.unwrap_or_else(Utc::now);
            debug!("任务 {} 已在重试状态，重新压入延迟列表", task_id);
            return Ok(FailureOutcome::Retrying {
                retry_count: task.retry_count,
                retry_at,
            });
        }
        if task.status != TaskStatus::Running {
            debug!("任务 {} 状态为 {}，忽略失败结果", task_id, task.status);
            return Ok(FailureOutcome::Skipped);
        }

        let now = Utc::now();
        if !task.can_retry() {
            task.mark_failed(error_message.to_string(), now)?;
            self.save(&task).await?;
            StructuredLogger::log_task_failed(
                &task.task_id,
                &task.task_name,
                task.attempts(),
                error_message,
            );
            return Ok(FailureOutcome::Failed);
        }

        let delay = self.backoff.delay(task.retry_delay, task.retry_count + 1);
        let retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        task.mark_retrying(error_message.to_string(), retry_at)?;
        self.save(&task).await?;
        self.push_id(&delayed_queue_key(&self.name), &task.task_id)
            .await?;

        self.metrics.record_task_retry(&self.name, &task.task_name);
        StructuredLogger::log_task_retry(
            &task.task_id,
            &task.task_name,
            task.retry_count,
            task.max_retries,
            retry_at,
            error_message,
        );
        Ok(FailureOutcome::Retrying {
            retry_count: task.retry_count,
            retry_at,
        })
    }

    /// 取消任务，终态任务不受影响并返回 false
    ///
    /// 不会中断正在执行的处理函数，只是其结果不再被记录。
    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<bool> {
        let mut task = self.require(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }

        let previous = task.status;
        task.mark_cancelled(Utc::now())?;
        self.save(&task).await?;
        StructuredLogger::log_task_cancelled(task_id, previous.as_str());
        Ok(true)
    }

    pub async fn get_task(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        self.load(task_id).await
    }

    pub async fn update_progress(&self, task_id: &str, progress: u8) -> SchedulerResult<bool> {
        let mut task = self.require(task_id).await?;
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        task.set_progress(progress);
        self.save(&task).await?;
        Ok(true)
    }

    /// 把到期的重试任务移回优先级列表，返回移动数量
    ///
    /// 遍历一次延迟列表，未到期的ID压回列表尾部。到期的ID先压入优先级列表
    /// 再写入 PENDING 记录；写入失败时ID同时放回延迟列表，优先级列表中
    /// 仍为 RETRYING 的副本会在出队时被丢弃。
    pub async fn promote_due_retries(&self) -> SchedulerResult<usize> {
        let delayed = delayed_queue_key(&self.name);
        let pending = self.store.list_length(&delayed).await?;
        let now = Utc::now();
        let mut promoted = 0;

        for _ in 0..pending {
            let Some(task_id) = self.store.list_pop_right(&delayed).await? else {
                break;
            };

            let mut task = match self.load(&task_id).await {
                Ok(Some(task)) if task.status == TaskStatus::Retrying => task,
                Ok(_) => {
                    debug!("延迟任务 {} 已不在重试状态，丢弃", task_id);
                    continue;
                }
                Err(e) if e.is_transient() => {
                    self.requeue_id(&delayed, &task_id).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("延迟任务记录无法解析，丢弃 {}: {}", task_id, e);
                    continue;
                }
            };

            if task.retry_at.is_some_and(|retry_at| retry_at > now) {
                self.push_id(&delayed, &task_id).await?;
                continue;
            }

            if let Err(e) = self
                .push_id(&queue_key(&self.name, task.priority), &task_id)
                .await
            {
                self.requeue_id(&delayed, &task_id).await;
                return Err(e);
            }
            task.mark_pending()?;
            if let Err(e) = self.save(&task).await {
                self.requeue_id(&delayed, &task_id).await;
                return Err(e);
            }
            promoted += 1;
        }

        if promoted > 0 {
            info!("队列 {} 重新入队 {} 个重试任务", self.name, promoted);
        }
        Ok(promoted)
    }

    /// 各优先级列表中待执行的ID总数
    pub async fn size(&self) -> SchedulerResult<usize> {
        let mut total = 0;
        for priority in TaskPriority::DRAIN_ORDER {
            total += self
                .store
                .list_length(&queue_key(&self.name, priority))
                .await?;
        }
        self.metrics.update_queue_depth(&self.name, total);
        Ok(total)
    }

    pub async fn delayed_size(&self) -> SchedulerResult<usize> {
        self.store.list_length(&delayed_queue_key(&self.name)).await
    }

    async fn load(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        match self.store.get(&task_key(task_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn require(&self, task_id: &str) -> SchedulerResult<Task> {
        self.load(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    /// 写回任务记录，终态记录带保留时间
    async fn save(&self, task: &Task) -> SchedulerResult<()> {
        let json = serde_json::to_string(task)?;
        let ttl = task.status.is_terminal().then_some(self.result_ttl);
        self.store.set(&task_key(&task.task_id), &json, ttl).await
    }

    /// 压入列表，存储暂时不可用时有限次重试
    async fn push_id(&self, list: &str, task_id: &str) -> SchedulerResult<()> {
        let mut attempt = 1;
        loop {
            match self.store.list_push_left(list, task_id).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < PUSH_ATTEMPTS => {
                    debug!("任务 {} 压入列表 {} 失败，第 {} 次重试: {}", task_id, list, attempt, e);
                    tokio::time::sleep(PUSH_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn requeue_id(&self, list: &str, task_id: &str) {
        if let Err(e) = self.push_id(list, task_id).await {
            error!("任务 {} 放回列表 {} 失败: {}", task_id, list, e);
        }
    }
}
