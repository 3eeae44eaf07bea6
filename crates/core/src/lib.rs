//! taskflow 核心库
//!
//! 错误类型、任务与作业模型、持久化存储抽象、处理函数注册表以及配置模型。

pub mod config;
pub mod errors;
pub mod models;
pub mod registry;
pub mod traits;

pub use errors::*;
pub use models::{
    JobArguments, JobStatus, JobType, ScheduledJob, Task, TaskOptions, TaskPriority, TaskStatus,
    TriggerConfig,
};
pub use registry::{FunctionRegistry, HandlerRegistry, Registry};
pub use traits::{DurableStore, JobFunction, TaskHandler};

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
