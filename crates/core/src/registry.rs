use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::traits::{JobFunction, TaskHandler};
use crate::{SchedulerError, SchedulerResult};

/// 名称到实现的注册表，进程内有效
///
/// 重复注册同一名称时以最后一次为准。
pub struct Registry<T: ?Sized + Send + Sync> {
    entries: Arc<RwLock<HashMap<String, Arc<T>>>>,
}

/// 队列任务处理函数注册表
pub type HandlerRegistry = Registry<dyn TaskHandler>;

/// 定时作业函数注册表
pub type FunctionRegistry = Registry<dyn JobFunction>;

impl<T: ?Sized + Send + Sync> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, name: impl Into<String>, entry: Arc<T>) {
        let mut entries = self.entries.write().await;
        entries.insert(name.into(), entry);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.read().await;
        entries.get(name).cloned()
    }

    /// 查找实现，未注册时返回 `HandlerNotFound`
    pub async fn require(&self, name: &str) -> SchedulerResult<Arc<T>> {
        self.get(name)
            .await
            .ok_or_else(|| SchedulerError::HandlerNotFound {
                name: name.to_string(),
            })
    }

    pub async fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().await;
        entries.contains_key(name)
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(name).is_some()
    }

    pub async fn names(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<T: ?Sized + Send + Sync> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + Send + Sync> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}
