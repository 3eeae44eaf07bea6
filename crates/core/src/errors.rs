use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("未注册的处理函数: {name}")]
    HandlerNotFound { name: String },

    #[error("任务执行超时 ({seconds}s)")]
    ExecutionTimeout { seconds: u64 },

    #[error("任务执行错误: {0}")]
    ExecutionError(String),

    #[error("任务 {task_id} 重试次数已耗尽 (共执行 {attempts} 次)")]
    RetriesExhausted { task_id: String, attempts: u32 },

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("作业 {job_id} 错过执行窗口 (延迟 {late_seconds}s)")]
    Misfire { job_id: String, late_seconds: i64 },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("作业未找到: {id}")]
    JobNotFound { id: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("非法的状态转换: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("无效的触发器配置: {0}")]
    InvalidTrigger(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// 是否为可重试的瞬时错误（存储暂不可达）
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::StoreUnavailable(_))
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_transient() {
        assert!(SchedulerError::StoreUnavailable("连接被拒绝".into()).is_transient());
        assert!(!SchedulerError::HandlerNotFound {
            name: "send_email".into()
        }
        .is_transient());
        assert!(!SchedulerError::ExecutionTimeout { seconds: 3 }.is_transient());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = SchedulerError::RetriesExhausted {
            task_id: "abc".into(),
            attempts: 3,
        };
        let text = err.to_string();
        assert!(text.contains("abc"));
        assert!(text.contains('3'));
    }
}
