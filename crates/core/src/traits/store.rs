use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// 持久化存储抽象接口
///
/// 任务队列与调度器的唯一事实来源。实现需保证单次调用内的
/// 列表弹出与单键读写是原子的，其余一致性由调用方维护。
/// 所有后端错误都应映射为 [`SchedulerError::StoreUnavailable`](crate::SchedulerError::StoreUnavailable)。
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// 读取键值，不存在或已过期时返回 None
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 写入键值，`ttl` 为 None 时永不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// 删除键，返回键是否存在
    async fn delete(&self, key: &str) -> Result<bool>;

    /// 从列表左端压入，返回压入后的长度
    async fn list_push_left(&self, key: &str, value: &str) -> Result<usize>;

    /// 从列表右端弹出
    async fn list_pop_right(&self, key: &str) -> Result<Option<String>>;

    /// 获取列表长度
    async fn list_length(&self, key: &str) -> Result<usize>;

    /// 按通配模式列出键（支持 `*` 与 `?`）
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// 健康检查
    async fn ping(&self) -> Result<()>;
}
