//! # 数据模型
//!
//! 任务队列与定时调度共享的核心数据结构。
//!
//! ## 核心模型
//!
//! ### Task - 队列任务
//! 一次可重试的异步执行单元，带优先级、重试计数、超时与执行结果。
//!
//! ### ScheduledJob - 定时作业
//! 按 CRON / 固定间隔 / 指定时间触发的具名函数调用，记录运行、成功与失败次数。
//!
//! ## 设计原则
//!
//! - 所有时间字段使用 `DateTime<Utc>`
//! - 状态字段使用枚举，序列化为大写字符串
//! - 状态转换通过 `mark_*` 方法完成，非法转换返回错误而不是静默覆盖
//!
//! ## 存储键
//!
//! ```text
//! task:{task_id}                 任务记录
//! queue:{queue_name}:{priority}  各优先级的任务ID列表
//! queue:{queue_name}:delayed     等待重试的任务ID列表
//! scheduled_job:{job_id}         作业记录
//! ```

pub mod job;
pub mod keys;
pub mod task;

pub use job::{
    CronFields, CronValue, IntervalConfig, JobArguments, JobStatus, JobType, ScheduledJob,
    TriggerConfig,
};
pub use task::{Task, TaskOptions, TaskPriority, TaskStatus};
