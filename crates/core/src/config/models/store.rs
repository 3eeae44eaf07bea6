use serde::{Deserialize, Serialize};

/// 存储后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    #[default]
    Memory,
    Redis,
}

/// Redis连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 30,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Redis主机地址不能为空"));
        }

        if self.port == 0 {
            return Err(anyhow::anyhow!("Redis端口必须大于0"));
        }

        if self.database < 0 {
            return Err(anyhow::anyhow!("Redis数据库索引不能为负数"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Redis连接超时时间必须大于0"));
        }

        if self.max_retry_attempts == 0 {
            return Err(anyhow::anyhow!("Redis最大重试次数必须大于0"));
        }

        Ok(())
    }

    /// 构建Redis连接URL
    pub fn build_url(&self) -> String {
        let auth = match &self.password {
            Some(password) => format!(":{password}@"),
            None => String::new(),
        };
        format!(
            "redis://{}{}:{}/{}",
            auth, self.host, self.port, self.database
        )
    }
}

/// 持久化存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub r#type: StoreType,
    /// 完整连接URL，设置后优先于 `redis` 段
    pub url: Option<String>,
    pub redis: RedisConfig,
    /// 所有键的命名空间前缀，为空时不加前缀
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            r#type: StoreType::Memory,
            url: None,
            redis: RedisConfig::default(),
            key_prefix: String::new(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.key_prefix.chars().any(char::is_whitespace) {
            return Err(anyhow::anyhow!("键前缀不能包含空白字符"));
        }
        if self.key_prefix.contains(['*', '?']) {
            return Err(anyhow::anyhow!("键前缀不能包含通配符"));
        }

        if self.r#type == StoreType::Redis {
            if let Some(url) = &self.url {
                if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                    return Err(anyhow::anyhow!("Redis URL必须是redis://或rediss://格式"));
                }
            }
            self.redis.validate()?;
        }

        Ok(())
    }

    /// Redis连接URL
    pub fn redis_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| self.redis.build_url())
    }
}
