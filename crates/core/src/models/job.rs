use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, SchedulerError};

/// 作业类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    Cron,
    Interval,
    Date,
}

/// 作业状态
///
/// 周期性作业在每次执行结束后回到 PENDING；DATE 作业执行一次后停在
/// COMPLETED / FAILED，错过执行窗口时停在 MISSED。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Missed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Paused,
        JobStatus::Missed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Paused => "PAUSED",
            JobStatus::Missed => "MISSED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CRON 字段取值：数字或 cron 字段表达式（如 `"*/5"`、`"1-5"`、`"mon-fri"`）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CronValue {
    Number(u32),
    Expr(String),
}

impl fmt::Display for CronValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronValue::Number(n) => write!(f, "{n}"),
            CronValue::Expr(e) => f.write_str(e.trim()),
        }
    }
}

impl From<u32> for CronValue {
    fn from(value: u32) -> Self {
        CronValue::Number(value)
    }
}

impl From<&str> for CronValue {
    fn from(value: &str) -> Self {
        CronValue::Expr(value.to_string())
    }
}

/// CRON 触发器字段，未设置的字段见 `taskflow_dispatcher::triggers` 的补全规则
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<CronValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<CronValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<CronValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<CronValue>,
    /// 0 = 周一 … 6 = 周日，或 `mon`..`sun`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<CronValue>,
    /// ISO 周序号
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week: Option<CronValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<CronValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<CronValue>,
}

impl CronFields {
    pub fn second(mut self, value: impl Into<CronValue>) -> Self {
        self.second = Some(value.into());
        self
    }

    pub fn minute(mut self, value: impl Into<CronValue>) -> Self {
        self.minute = Some(value.into());
        self
    }

    pub fn hour(mut self, value: impl Into<CronValue>) -> Self {
        self.hour = Some(value.into());
        self
    }

    pub fn day(mut self, value: impl Into<CronValue>) -> Self {
        self.day = Some(value.into());
        self
    }

    pub fn day_of_week(mut self, value: impl Into<CronValue>) -> Self {
        self.day_of_week = Some(value.into());
        self
    }

    pub fn week(mut self, value: impl Into<CronValue>) -> Self {
        self.week = Some(value.into());
        self
    }

    pub fn month(mut self, value: impl Into<CronValue>) -> Self {
        self.month = Some(value.into());
        self
    }

    pub fn year(mut self, value: impl Into<CronValue>) -> Self {
        self.year = Some(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == CronFields::default()
    }
}

/// 固定间隔，各分量相加得到一个周期
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntervalConfig {
    #[serde(default)]
    pub weeks: u64,
    #[serde(default)]
    pub days: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub seconds: u64,
}

impl IntervalConfig {
    pub fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    /// 周期总秒数，溢出时返回 None
    pub fn total_seconds(&self) -> Option<u64> {
        [
            (self.weeks, 7 * 86_400),
            (self.days, 86_400),
            (self.hours, 3_600),
            (self.minutes, 60),
            (self.seconds, 1),
        ]
        .into_iter()
        .try_fold(0u64, |total, (value, unit)| {
            value.checked_mul(unit).and_then(|secs| total.checked_add(secs))
        })
    }

    pub fn period(&self) -> Result<Duration> {
        let total = self.total_seconds().ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!("间隔过大: {self:?}"))
        })?;
        if total == 0 {
            return Err(SchedulerError::InvalidTrigger(
                "间隔触发器的周期必须大于0".to_string(),
            ));
        }
        i64::try_from(total)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| SchedulerError::InvalidTrigger(format!("间隔过大: {total}s")))
    }
}

/// 触发器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerConfig {
    Cron(CronFields),
    Interval(IntervalConfig),
    Date { run_date: DateTime<Utc> },
}

impl TriggerConfig {
    pub fn job_type(&self) -> JobType {
        match self {
            TriggerConfig::Cron(_) => JobType::Cron,
            TriggerConfig::Interval(_) => JobType::Interval,
            TriggerConfig::Date { .. } => JobType::Date,
        }
    }
}

/// 传给作业函数的参数
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobArguments {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl JobArguments {
    pub fn new(
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self { args, kwargs }
    }
}

/// 定时作业
///
/// 记录保存在 `scheduled_job:{job_id}` 下，由调度循环以及
/// pause / resume / remove 修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub job_name: String,
    pub job_type: JobType,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub trigger_config: TriggerConfig,
    pub max_instances: u32,
    /// 允许延迟执行的最长时间（秒）
    pub misfire_grace_time: u64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    pub fn new(
        job_name: impl Into<String>,
        function_name: impl Into<String>,
        trigger_config: TriggerConfig,
        arguments: JobArguments,
        max_instances: u32,
        misfire_grace_time: u64,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_name: job_name.into(),
            job_type: trigger_config.job_type(),
            function_name: function_name.into(),
            args: arguments.args,
            kwargs: arguments.kwargs,
            trigger_config,
            max_instances: max_instances.max(1),
            misfire_grace_time,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            last_run: None,
            next_run: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            last_error: None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.job_type != JobType::Date
    }

    /// 调度循环是否应考虑该作业
    pub fn is_schedulable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running) && self.next_run.is_some()
    }

    pub fn arguments(&self) -> JobArguments {
        JobArguments::new(self.args.clone(), self.kwargs.clone())
    }

    /// 正在执行中的调用数（已计入 run_count 但尚未记录结果）
    pub fn unfinished_runs(&self) -> u64 {
        self.run_count
            .saturating_sub(self.success_count + self.failure_count)
    }
}
