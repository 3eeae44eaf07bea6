use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use std::net::SocketAddr;
use taskflow_core::config::LogFormat;
use taskflow_core::SchedulerError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 队列与调度指标
///
/// 未安装 recorder 时所有调用都是空操作。
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn record_task_enqueued(&self, queue: &str, task_name: &str) {
        counter!(
            "taskflow_tasks_enqueued_total",
            "queue" => queue.to_string(),
            "task" => task_name.to_string()
        )
        .increment(1);
    }

    /// 记录一次任务执行，status 为 completed / failed / retrying / cancelled
    pub fn record_task_execution(
        &self,
        queue: &str,
        task_name: &str,
        status: &str,
        duration_seconds: f64,
    ) {
        counter!(
            "taskflow_task_executions_total",
            "queue" => queue.to_string(),
            "task" => task_name.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            "taskflow_task_execution_duration_seconds",
            "queue" => queue.to_string(),
            "task" => task_name.to_string()
        )
        .record(duration_seconds);
    }

    pub fn record_task_failure(&self, queue: &str, task_name: &str, error_type: &str) {
        counter!(
            "taskflow_task_failures_total",
            "queue" => queue.to_string(),
            "task" => task_name.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    pub fn record_task_retry(&self, queue: &str, task_name: &str) {
        counter!(
            "taskflow_task_retries_total",
            "queue" => queue.to_string(),
            "task" => task_name.to_string()
        )
        .increment(1);
    }

    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        gauge!("taskflow_queue_depth", "queue" => queue.to_string()).set(depth as f64);
    }

    pub fn record_job_run(&self, job_name: &str, success: bool, duration_seconds: f64) {
        counter!("taskflow_job_runs_total", "job" => job_name.to_string()).increment(1);
        histogram!(
            "taskflow_job_execution_duration_seconds",
            "job" => job_name.to_string()
        )
        .record(duration_seconds);
        if !success {
            counter!("taskflow_job_failures_total", "job" => job_name.to_string()).increment(1);
        }
    }

    pub fn record_job_misfire(&self, job_name: &str) {
        counter!("taskflow_job_misfires_total", "job" => job_name.to_string()).increment(1);
    }
}

/// 日志初始化参数
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_location: false,
        }
    }
}

/// 初始化结构化日志，`RUST_LOG` 优先于配置的级别
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .context("无效的日志级别")?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(config.include_location)
                .with_line_number(config.include_location);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_file(config.include_location)
                .with_line_number(config.include_location);
            registry.with(fmt_layer).try_init()
        }
    }
    .context("初始化日志失败")?;

    info!(
        logging.format = ?config.format,
        logging.level = %config.level,
        "日志系统已初始化"
    );

    Ok(())
}

/// 安装Prometheus exporter并在给定地址暴露 /metrics
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus exporter失败: {e}"))?;

    info!("Prometheus指标已在 {} 暴露", addr);
    Ok(())
}

/// 结构化事件日志
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_enqueued(task_id: &str, task_name: &str, queue: &str, priority: &str) {
        info!(
            event = "task_enqueued",
            task.id = task_id,
            task.name = task_name,
            task.queue = queue,
            task.priority = priority,
            "任务已入队"
        );
    }

    pub fn log_task_started(task_id: &str, task_name: &str, worker_id: &str, attempt: u32) {
        info!(
            event = "task_started",
            task.id = task_id,
            task.name = task_name,
            worker.id = worker_id,
            task.attempt = attempt,
            "任务开始执行"
        );
    }

    pub fn log_task_completed(task_id: &str, task_name: &str, worker_id: &str, duration_ms: u64) {
        info!(
            event = "task_completed",
            task.id = task_id,
            task.name = task_name,
            worker.id = worker_id,
            task.duration_ms = duration_ms,
            "任务执行成功"
        );
    }

    pub fn log_task_retry(
        task_id: &str,
        task_name: &str,
        retry_count: u32,
        max_retries: u32,
        retry_at: DateTime<Utc>,
        reason: &str,
    ) {
        warn!(
            event = "task_retry",
            task.id = task_id,
            task.name = task_name,
            task.retry_count = retry_count,
            task.max_retries = max_retries,
            task.retry_at = %retry_at,
            task.retry_reason = reason,
            "任务执行失败，等待重试"
        );
    }

    pub fn log_task_failed(task_id: &str, task_name: &str, attempts: u32, reason: &str) {
        error!(
            event = "task_failed",
            task.id = task_id,
            task.name = task_name,
            task.attempts = attempts,
            task.error = reason,
            "任务最终失败"
        );
    }

    pub fn log_task_cancelled(task_id: &str, previous_status: &str) {
        info!(
            event = "task_cancelled",
            task.id = task_id,
            task.previous_status = previous_status,
            "任务已取消"
        );
    }

    pub fn log_job_fired(job_id: &str, job_name: &str, scheduled_at: DateTime<Utc>) {
        info!(
            event = "job_fired",
            job.id = job_id,
            job.name = job_name,
            job.scheduled_at = %scheduled_at,
            "作业开始执行"
        );
    }

    pub fn log_job_finished(
        job_id: &str,
        job_name: &str,
        success: bool,
        duration_ms: u64,
        error_message: Option<&str>,
    ) {
        if success {
            info!(
                event = "job_finished",
                job.id = job_id,
                job.name = job_name,
                job.duration_ms = duration_ms,
                "作业执行成功"
            );
        } else {
            error!(
                event = "job_failed",
                job.id = job_id,
                job.name = job_name,
                job.duration_ms = duration_ms,
                job.error = error_message.unwrap_or("未知错误"),
                "作业执行失败"
            );
        }
    }

    pub fn log_job_misfire(job_name: &str, misfire: &SchedulerError, grace_seconds: u64) {
        if let SchedulerError::Misfire {
            job_id,
            late_seconds,
        } = misfire
        {
            warn!(
                event = "job_misfire",
                job.id = job_id.as_str(),
                job.name = job_name,
                job.late_seconds = *late_seconds,
                job.grace_seconds = grace_seconds,
                "{}，跳过本次执行",
                misfire
            );
        }
    }

    pub fn log_job_skipped(job_id: &str, job_name: &str, running: u32, max_instances: u32) {
        warn!(
            event = "job_skipped",
            job.id = job_id,
            job.name = job_name,
            job.running = running,
            job.max_instances = max_instances,
            "作业达到最大并发实例数，跳过本次执行"
        );
    }
}
