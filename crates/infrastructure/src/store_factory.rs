use std::sync::Arc;
use taskflow_core::config::{StoreConfig, StoreType};
use taskflow_core::{DurableStore, SchedulerResult};
use tracing::{debug, info};

use crate::{InMemoryStore, RedisStore};

pub struct StoreFactory;

impl StoreFactory {
    pub async fn create(config: &StoreConfig) -> SchedulerResult<Arc<dyn DurableStore>> {
        debug!("创建存储后端: {:?}", config.r#type);

        match config.r#type {
            StoreType::Memory => {
                info!("使用内存存储，进程退出后数据不会保留");
                Ok(Arc::new(InMemoryStore::new()))
            }
            StoreType::Redis => {
                info!(
                    "使用Redis存储 {}:{} (前缀: {:?})",
                    config.redis.host, config.redis.port, config.key_prefix
                );
                let store = RedisStore::connect(config).await?;
                Ok(Arc::new(store))
            }
        }
    }
}
