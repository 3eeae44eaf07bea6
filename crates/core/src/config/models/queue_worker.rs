use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::{TaskOptions, TaskPriority};

/// 队列默认参数与重试退避
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_priority: TaskPriority,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub timeout_seconds: u64,
    /// 第 n 次重试的延迟为 retry_delay * multiplier^(n-1)
    pub backoff_multiplier: f64,
    pub max_retry_delay_seconds: u64,
    /// 0.0 ~ 1.0，按比例叠加的随机抖动
    pub jitter_factor: f64,
    /// 终态任务记录的保留时间
    pub result_ttl_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_priority: TaskPriority::Normal,
            max_retries: 3,
            retry_delay_seconds: 60,
            timeout_seconds: 300,
            backoff_multiplier: 1.0,
            max_retry_delay_seconds: 3600,
            jitter_factor: 0.0,
            result_ttl_seconds: 86_400,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数必须不小于1.0"));
        }

        if self.max_retry_delay_seconds < self.retry_delay_seconds {
            return Err(anyhow::anyhow!(
                "最大重试延迟 ({}s) 不能小于重试延迟 ({}s)",
                self.max_retry_delay_seconds,
                self.retry_delay_seconds
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动系数必须在0.0到1.0之间"));
        }

        if self.result_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("结果保留时间必须大于0"));
        }

        Ok(())
    }

    /// 入队时使用的默认参数
    pub fn task_options(&self) -> TaskOptions {
        TaskOptions {
            priority: self.default_priority,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay_seconds,
            timeout: self.timeout_seconds,
        }
    }
}

/// 单个队列的Worker数量
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueWorkers {
    pub name: String,
    pub workers: usize,
}

/// Worker池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub queues: Vec<QueueWorkers>,
    /// 队列为空时的轮询间隔
    pub poll_interval_ms: u64,
    /// 存储不可用时的初始退避
    pub store_backoff_initial_ms: u64,
    pub store_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queues: vec![QueueWorkers {
                name: "default".to_string(),
                workers: 4,
            }],
            poll_interval_ms: 1000,
            store_backoff_initial_ms: 500,
            store_backoff_max_ms: 30_000,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.store_backoff_initial_ms == 0 {
            return Err(anyhow::anyhow!("存储退避初始值必须大于0"));
        }

        if self.store_backoff_max_ms < self.store_backoff_initial_ms {
            return Err(anyhow::anyhow!("存储退避最大值不能小于初始值"));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(anyhow::anyhow!("队列名称不能为空"));
            }
            if queue.name.contains([':', '*', '?']) {
                return Err(anyhow::anyhow!("队列名称包含非法字符: {}", queue.name));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(anyhow::anyhow!("队列重复配置: {}", queue.name));
            }
        }

        Ok(())
    }
}
