use std::env;
use std::io::Write;

use taskflow_core::config::{AppConfig, StoreType};
use taskflow_core::TaskPriority;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
        [store]
        type = "redis"
        key_prefix = "tf"

        [store.redis]
        host = "redis.internal"
        port = 6380

        [queue]
        default_priority = "LOW"

        [[worker.queues]]
        name = "mail"
        workers = 2

        [[worker.queues]]
        name = "reports"
        workers = 1
        "#,
    );

    let config = AppConfig::load(file.path().to_str()).unwrap();
    assert_eq!(config.store.r#type, StoreType::Redis);
    assert_eq!(config.store.redis_url(), "redis://redis.internal:6380/0");
    assert_eq!(config.queue.default_priority, TaskPriority::Low);
    assert_eq!(config.worker.queues.len(), 2);
    assert_eq!(config.worker.queues[0].name, "mail");
}

#[test]
fn test_missing_file_is_an_error() {
    let result = AppConfig::load(Some("/nonexistent/taskflow.toml"));
    assert!(result.is_err());
}

#[test]
fn test_environment_overrides_file() {
    let file = write_config(
        r#"
        [scheduler]
        misfire_grace_time_seconds = 10
        "#,
    );

    env::set_var("TASKFLOW_SCHEDULER__MISFIRE_GRACE_TIME_SECONDS", "45");
    let config = AppConfig::load(file.path().to_str());
    env::remove_var("TASKFLOW_SCHEDULER__MISFIRE_GRACE_TIME_SECONDS");

    let config = config.unwrap();
    assert_eq!(config.scheduler.misfire_grace_time_seconds, 45);
}

#[test]
fn test_invalid_file_fails_validation() {
    let file = write_config(
        r#"
        [queue]
        retry_delay_seconds = 120
        max_retry_delay_seconds = 60
        "#,
    );

    let err = AppConfig::load(file.path().to_str()).unwrap_err();
    assert!(format!("{err:#}").contains("队列配置验证失败"));
}
