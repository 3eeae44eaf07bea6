use std::time::Duration;

use taskflow_core::config::{RedisConfig, StoreConfig, StoreType};
use taskflow_core::DurableStore;
use taskflow_infrastructure::{RedisStore, StoreFactory};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

async fn start_redis(key_prefix: &str) -> (ContainerAsync<Redis>, StoreConfig) {
    let container = Redis::default()
        .with_tag("7-alpine")
        .start()
        .await
        .expect("启动Redis容器失败");
    let port = container.get_host_port_ipv4(6379).await.unwrap();

    let config = StoreConfig {
        r#type: StoreType::Redis,
        url: None,
        redis: RedisConfig {
            port,
            ..RedisConfig::default()
        },
        key_prefix: key_prefix.to_string(),
    };
    (container, config)
}

#[tokio::test]
#[ignore] // 需要Docker
async fn test_redis_store_basic_operations() {
    let (_container, config) = start_redis("").await;
    let store = RedisStore::connect(&config).await.unwrap();

    store.ping().await.unwrap();
    store.set("task:1", r#"{"a":1}"#, None).await.unwrap();
    assert_eq!(
        store.get("task:1").await.unwrap().as_deref(),
        Some(r#"{"a":1}"#)
    );
    assert!(store.delete("task:1").await.unwrap());
    assert_eq!(store.get("task:1").await.unwrap(), None);

    for id in ["a", "b"] {
        store.list_push_left("queue:default:high", id).await.unwrap();
    }
    assert_eq!(store.list_length("queue:default:high").await.unwrap(), 2);
    assert_eq!(
        store.list_pop_right("queue:default:high").await.unwrap().as_deref(),
        Some("a")
    );
}

#[tokio::test]
#[ignore] // 需要Docker
async fn test_redis_store_ttl_and_prefixed_keys() {
    let (_container, config) = start_redis("tf").await;
    let store = StoreFactory::create(&config).await.unwrap();

    store
        .set("scheduled_job:1", "{}", Some(Duration::from_millis(200)))
        .await
        .unwrap();
    store.set("scheduled_job:2", "{}", None).await.unwrap();

    let keys = store.keys("scheduled_job:*").await.unwrap();
    assert_eq!(keys, vec!["scheduled_job:1", "scheduled_job:2"]);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.get("scheduled_job:1").await.unwrap(), None);
    assert_eq!(store.keys("scheduled_job:*").await.unwrap().len(), 1);
}
