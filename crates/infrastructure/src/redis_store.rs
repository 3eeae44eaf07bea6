use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use std::time::Duration;
use taskflow_core::config::StoreConfig;
use taskflow_core::{DurableStore, SchedulerError, SchedulerResult};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

const SCAN_BATCH_SIZE: usize = 500;

/// 基于Redis的持久化存储
///
/// 使用 `ConnectionManager` 自动重连。所有Redis错误都映射为
/// `StoreUnavailable`，由调用方决定退避重试。
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// 建立连接，按配置的次数重试
    pub async fn connect(config: &StoreConfig) -> SchedulerResult<Self> {
        let url = config.redis_url();
        let client = Client::open(url.as_str())
            .map_err(|e| SchedulerError::StoreUnavailable(format!("创建Redis客户端失败: {e}")))?;

        let attempts = config.redis.max_retry_attempts.max(1);
        let connect_timeout = Duration::from_secs(config.redis.connection_timeout_seconds);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match timeout(connect_timeout, ConnectionManager::new(client.clone())).await {
                Ok(Ok(connection)) => {
                    let store = Self {
                        connection,
                        key_prefix: config.key_prefix.clone(),
                    };
                    store.ping().await?;
                    debug!(
                        "已连接Redis {}:{} (第{}次尝试)",
                        config.redis.host, config.redis.port, attempt
                    );
                    return Ok(store);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("连接超时 ({}s)", connect_timeout.as_secs()),
            }

            if attempt < attempts {
                warn!(
                    "连接Redis失败 ({}/{}): {}，{}s后重试",
                    attempt, attempts, last_error, config.redis.retry_delay_seconds
                );
                sleep(Duration::from_secs(config.redis.retry_delay_seconds)).await;
            }
        }

        let message = format!("连接Redis失败，已重试{attempts}次: {last_error}");
        error!("{}", message);
        Err(SchedulerError::StoreUnavailable(message))
    }

    fn full_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    fn strip_prefix(&self, key: String) -> String {
        if self.key_prefix.is_empty() {
            return key;
        }
        match key.strip_prefix(&format!("{}:", self.key_prefix)) {
            Some(stripped) => stripped.to_string(),
            None => key,
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> SchedulerResult<T> {
        let mut connection = self.connection.clone();
        cmd.query_async(&mut connection).await.map_err(|e| {
            warn!("Redis命令执行失败: {}", e);
            SchedulerError::StoreUnavailable(format!("Redis命令执行失败: {e}"))
        })
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> SchedulerResult<Option<String>> {
        self.query(redis::cmd("GET").arg(self.full_key(key))).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> SchedulerResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        self.query::<()>(&cmd).await
    }

    async fn delete(&self, key: &str) -> SchedulerResult<bool> {
        let removed: usize = self.query(redis::cmd("DEL").arg(self.full_key(key))).await?;
        Ok(removed > 0)
    }

    async fn list_push_left(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        self.query(redis::cmd("LPUSH").arg(self.full_key(key)).arg(value))
            .await
    }

    async fn list_pop_right(&self, key: &str) -> SchedulerResult<Option<String>> {
        self.query(redis::cmd("RPOP").arg(self.full_key(key))).await
    }

    async fn list_length(&self, key: &str) -> SchedulerResult<usize> {
        self.query(redis::cmd("LLEN").arg(self.full_key(key))).await
    }

    async fn keys(&self, pattern: &str) -> SchedulerResult<Vec<String>> {
        let full_pattern = self.full_key(pattern);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&full_pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH_SIZE),
                )
                .await?;
            keys.extend(batch.into_iter().map(|key| self.strip_prefix(key)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> SchedulerResult<()> {
        let response: String = self.query(&redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(SchedulerError::StoreUnavailable(format!(
                "PING返回异常: {response}"
            )))
        }
    }
}
