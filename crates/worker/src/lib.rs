//! 任务队列与Worker池
//!
//! - [`TaskQueue`]：按优先级分列表的持久化队列，负责任务状态转换
//! - [`TaskWorker`]：单队列上的执行循环
//! - [`TaskManager`]：管理多个队列与Worker池，提供统计

pub mod manager;
pub mod queue;
pub mod worker;

pub use manager::{QueueStats, TaskManager, TaskStats};
pub use queue::{BackoffPolicy, FailureOutcome, TaskQueue};
pub use worker::{TaskWorker, WorkerSettings, WorkerStats};
