//! # taskflow
//!
//! 持久化任务队列、Worker池与定时作业调度。
//!
//! - [`taskflow_worker`]：优先级任务队列、重试与超时、Worker池
//! - [`taskflow_dispatcher`]：CRON / 间隔 / 指定时间作业调度
//! - [`taskflow_infrastructure`]：内存与Redis存储、日志与指标
//!
//! [`app::Application`] 是按 [`AppConfig`](taskflow_core::config::AppConfig) 组装这些组件的入口。

pub mod app;
pub mod builtin;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
