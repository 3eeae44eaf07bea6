//! # taskflow 定时作业调度
//!
//! 按 CRON、固定间隔或指定时间触发已注册的作业函数。
//!
//! ```text
//! tick ──► 扫描 scheduled_job:* ──► 错过窗口? ──► 记录 misfire，推进 next_run
//!                                 │
//!                                 ├─► 并发已满? ──► 跳过本次，推进 next_run
//!                                 │
//!                                 └─► 写回占用 ──► tokio 任务执行 ──► 写回结果
//! ```

pub mod scheduler;
pub mod triggers;

pub use scheduler::{JobOptions, SchedulerService, SchedulerSettings, SchedulerStats};
pub use triggers::{CronTrigger, IntervalTrigger, Trigger};
