use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    observability::ObservabilityConfig,
    queue_worker::{QueueConfig, WorkerConfig},
    scheduler::SchedulerConfig,
    store::StoreConfig,
};

/// 默认配置文件搜索路径
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/taskflow.toml",
    "taskflow.toml",
    "/etc/taskflow/config.toml",
];

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 各配置段的默认值
    /// 2. 配置文件（TOML），未指定路径时依次尝试 [`DEFAULT_CONFIG_PATHS`]
    /// 3. 环境变量覆盖，前缀 `TASKFLOW_`，层级之间用 `__` 分隔，
    ///    例如 `TASKFLOW_STORE__TYPE=redis`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 序列化为TOML字符串
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.store.validate().context("存储配置验证失败")?;
        self.queue.validate().context("队列配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogFormat, StoreType};
    use crate::models::{TaskPriority, TriggerConfig};

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.r#type, StoreType::Memory);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [queue]
            default_priority = "HIGH"
            retry_delay_seconds = 5

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.default_priority, TaskPriority::High);
        assert_eq!(config.queue.retry_delay_seconds, 5);
        assert_eq!(config.queue.timeout_seconds, 300);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.worker.queues.len(), 1);
    }

    #[test]
    fn test_declared_jobs_parse() {
        let config = AppConfig::from_toml(
            r#"
            [[scheduler.jobs]]
            name = "heartbeat"
            function = "log"
            args = ["alive"]

            [scheduler.jobs.trigger]
            type = "interval"
            seconds = 30

            [[scheduler.jobs]]
            name = "nightly"
            function = "echo"
            max_instances = 2

            [scheduler.jobs.trigger]
            type = "cron"
            hour = 2
            minute = "*/30"
            "#,
        )
        .unwrap();

        let jobs = &config.scheduler.jobs;
        assert_eq!(jobs.len(), 2);
        assert!(matches!(jobs[0].trigger, TriggerConfig::Interval(i) if i.seconds == 30));
        assert!(matches!(&jobs[1].trigger, TriggerConfig::Cron(c) if c.hour.is_some()));
        assert_eq!(jobs[1].max_instances, Some(2));
    }

    #[test]
    fn test_invalid_sections_are_rejected() {
        let mut config = AppConfig::default();
        config.queue.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.r#type = StoreType::Redis;
        config.store.url = Some("http://localhost".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.observability.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.queues.push(config.worker.queues[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let back = AppConfig::from_toml(&text).unwrap();
        assert_eq!(back.worker.queues, config.worker.queues);
        assert_eq!(back.store.redis.port, 6379);
    }
}
