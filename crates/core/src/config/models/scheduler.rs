use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::TriggerConfig;

/// 配置文件中声明的定时作业
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefinition {
    pub name: String,
    pub function: String,
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// 未设置时使用 `scheduler.max_instances`
    #[serde(default)]
    pub max_instances: Option<u32>,
    /// 未设置时使用 `scheduler.misfire_grace_time_seconds`
    #[serde(default)]
    pub misfire_grace_time: Option<u64>,
}

/// 定时调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// 作业记录的基础保留时间，每次修改时刷新
    pub job_ttl_seconds: u64,
    pub misfire_grace_time_seconds: u64,
    pub max_instances: u32,
    pub jobs: Vec<JobDefinition>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1000,
            job_ttl_seconds: 86_400,
            misfire_grace_time_seconds: 30,
            max_instances: 1,
            jobs: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        if self.job_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("作业保留时间必须大于0"));
        }

        if self.max_instances == 0 {
            return Err(anyhow::anyhow!("最大并发实例数必须大于0"));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(anyhow::anyhow!("作业名称不能为空"));
            }
            if job.function.is_empty() {
                return Err(anyhow::anyhow!("作业 {} 的函数名称不能为空", job.name));
            }
            if job.max_instances == Some(0) {
                return Err(anyhow::anyhow!("作业 {} 的最大并发实例数必须大于0", job.name));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(anyhow::anyhow!("作业重复声明: {}", job.name));
            }
        }

        Ok(())
    }
}
