use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::JobArguments;

/// 队列任务处理函数
///
/// 接收任务的 payload，返回值写入任务的 `result`。
/// 返回错误会触发重试或失败转换。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        (self)(payload).await
    }
}

/// 定时作业函数
#[async_trait]
pub trait JobFunction: Send + Sync {
    async fn call(&self, arguments: JobArguments) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> JobFunction for F
where
    F: Fn(JobArguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, arguments: JobArguments) -> anyhow::Result<Value> {
        (self)(arguments).await
    }
}
