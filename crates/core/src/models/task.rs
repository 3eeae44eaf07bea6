use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, SchedulerError};

/// 任务优先级
///
/// 出队时总是先取更高优先级的子队列，同一优先级内保持先进先出。
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// 出队时各优先级子队列的排空顺序
    pub const DRAIN_ORDER: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// 用于存储键的小写名称
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            _ => Err(SchedulerError::InvalidTaskParams(format!(
                "无效的任务优先级: {s}"
            ))),
        }
    }
}

/// 任务状态
///
/// ```text
/// PENDING → RUNNING → COMPLETED
///    ↑         ├────→ FAILED
///    │         ├────→ CANCELLED
///    └─ RETRYING ←┘
/// ```
///
/// CANCELLED 可由 PENDING、RETRYING 或 RUNNING 进入；COMPLETED、FAILED、CANCELLED 为终态。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Retrying,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 检查状态机是否允许该转换
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Retrying => "RETRYING",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 入队参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    pub priority: TaskPriority,
    pub max_retries: u32,
    /// 失败后重新入队前的等待时间（秒）
    pub retry_delay: u64,
    /// 单次执行的超时时间（秒）
    pub timeout: u64,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            max_retries: 3,
            retry_delay: 60,
            timeout: 300,
        }
    }
}

impl TaskOptions {
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: u64) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }
}

/// 任务定义
///
/// 一次可重试的异步执行单元。记录以 JSON 形式保存在 `task:{task_id}` 下，
/// 每次状态转换后都会写回存储。
///
/// # 使用示例
///
/// ```rust
/// use taskflow_core::models::{Task, TaskOptions, TaskPriority, TaskStatus};
/// use serde_json::json;
///
/// let task = Task::new(
///     "default",
///     "send_report",
///     json!({"report_id": 42}),
///     &TaskOptions::default().priority(TaskPriority::High),
/// );
/// assert_eq!(task.status, TaskStatus::Pending);
/// assert_eq!(task.retry_count, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub task_name: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub max_retries: u32,
    pub retry_delay: u64,
    pub timeout: u64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// RETRYING 状态下最早可重新入队的时间
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub progress: u8,
}

impl Task {
    /// 创建新任务（PENDING）
    pub fn new(
        queue_name: impl Into<String>,
        task_name: impl Into<String>,
        payload: serde_json::Value,
        options: &TaskOptions,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            queue_name: queue_name.into(),
            payload,
            priority: options.priority,
            max_retries: options.max_retries,
            retry_delay: options.retry_delay,
            timeout: options.timeout,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_at: None,
            retry_count: 0,
            error_message: None,
            result: None,
            progress: 0,
        }
    }

    /// 是否还有剩余的重试次数
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 已执行的次数（含当前这次）
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.progress = 100;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_retrying(&mut self, error: String, retry_at: DateTime<Utc>) -> Result<()> {
        if !self.can_retry() {
            return Err(SchedulerError::RetriesExhausted {
                task_id: self.task_id.clone(),
                attempts: self.attempts(),
            });
        }
        self.transition(TaskStatus::Retrying)?;
        self.retry_count += 1;
        self.error_message = Some(error);
        self.retry_at = Some(retry_at);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.retry_at = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// RETRYING → PENDING，重新回到优先级队列
    pub fn mark_pending(&mut self) -> Result<()> {
        self.transition(TaskStatus::Pending)?;
        self.retry_at = None;
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}
