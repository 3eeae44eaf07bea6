use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use taskflow_core::{DurableStore, SchedulerResult};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

/// 内存存储实现
///
/// 适用于嵌入式部署和测试。过期键在读取时视为不存在，
/// 在写入或列出键时被清理。进程退出后数据丢失。
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清理所有已过期的键，返回清理数量
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        Self::purge_locked(&mut inner, Instant::now())
    }

    fn purge_locked(inner: &mut Inner, now: Instant) -> usize {
        let before = inner.values.len();
        inner.values.retain(|_, entry| !entry.is_expired(now));
        let removed = before - inner.values.len();
        if removed > 0 {
            debug!("清理过期键 {} 个", removed);
        }
        removed
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, key: &str) -> SchedulerResult<Option<String>> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        Ok(inner
            .values
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> SchedulerResult<()> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> SchedulerResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let value_removed = inner
            .values
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now));
        let list_removed = inner.lists.remove(key).is_some();
        Ok(value_removed || list_removed)
    }

    async fn list_push_left(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        let mut inner = self.inner.write().await;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len())
    }

    async fn list_pop_right(&self, key: &str) -> SchedulerResult<Option<String>> {
        let mut inner = self.inner.write().await;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_back();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(value)
    }

    async fn list_length(&self, key: &str) -> SchedulerResult<usize> {
        let inner = self.inner.read().await;
        Ok(inner.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn keys(&self, pattern: &str) -> SchedulerResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        Self::purge_locked(&mut inner, Instant::now());

        let mut keys: Vec<String> = inner
            .values
            .keys()
            .chain(inner.lists.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> SchedulerResult<()> {
        Ok(())
    }
}

/// Redis风格的通配匹配，支持 `*` 与 `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("task:*", "task:abc"));
        assert!(glob_match("task:*", "task:"));
        assert!(!glob_match("task:*", "scheduled_job:abc"));
        assert!(glob_match("queue:?:high", "queue:a:high"));
        assert!(!glob_match("queue:?:high", "queue:ab:high"));
        assert!(glob_match("*:delayed", "queue:mail:delayed"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1", None).await.unwrap();
        store.set("k", "v2", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_fifo_with_push_left_pop_right() {
        let store = InMemoryStore::new();
        for id in ["a", "b", "c"] {
            store.list_push_left("q", id).await.unwrap();
        }
        assert_eq!(store.list_length("q").await.unwrap(), 3);

        assert_eq!(store.list_pop_right("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.list_pop_right("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.list_pop_right("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.list_pop_right("q").await.unwrap(), None);
        assert_eq!(store.list_length("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("short", "x", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        store.set("long", "y", None).await.unwrap();
        assert!(store.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.keys("*").await.unwrap(), vec!["long".to_string()]);
    }

    #[tokio::test]
    async fn test_keys_covers_values_and_lists() {
        let store = InMemoryStore::new();
        store.set("task:1", "{}", None).await.unwrap();
        store.set("task:2", "{}", None).await.unwrap();
        store.list_push_left("queue:default:high", "1").await.unwrap();

        assert_eq!(store.keys("task:*").await.unwrap().len(), 2);
        assert_eq!(
            store.keys("queue:*").await.unwrap(),
            vec!["queue:default:high".to_string()]
        );
    }
}
