//! 内置的任务处理函数与作业函数
//!
//! | 名称    | 任务 payload                          | 作业参数                              |
//! |---------|---------------------------------------|---------------------------------------|
//! | `echo`  | 原样返回                              | 返回 `{"args": [...], "kwargs": {...}}` |
//! | `sleep` | `{"seconds": 1.5}`                    | `kwargs.seconds` 或 `args[0]`         |
//! | `log`   | `{"message": "...", "level": "info"}` | `kwargs.message` 或 `args` 拼接       |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use taskflow_core::{JobArguments, JobFunction, TaskHandler};
use taskflow_dispatcher::SchedulerService;
use taskflow_worker::TaskManager;
use tracing::{debug, error, info, warn};

pub const BUILTIN_NAMES: [&str; 3] = ["echo", "sleep", "log"];

/// sleep 允许的最长时间（秒）
const MAX_SLEEP_SECONDS: f64 = 3600.0;

/// 在指定队列上注册全部内置任务处理函数
pub async fn register_builtin_handlers(manager: &TaskManager, queue_name: &str) {
    for name in BUILTIN_NAMES {
        manager
            .register_handler(queue_name, name, builtin_handler(name))
            .await;
    }
    debug!("队列 {} 已注册内置处理函数", queue_name);
}

/// 注册全部内置作业函数
pub async fn register_builtin_functions(scheduler: &SchedulerService) {
    for name in BUILTIN_NAMES {
        scheduler
            .register_function(name, builtin_function(name))
            .await;
    }
}

fn builtin_handler(name: &str) -> Arc<dyn TaskHandler> {
    match name {
        "sleep" => Arc::new(|payload: Value| async move {
            let seconds = payload.get("seconds").cloned().unwrap_or(json!(1));
            sleep_for(&seconds).await
        }),
        "log" => Arc::new(|payload: Value| async move {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string());
            let level = payload.get("level").and_then(Value::as_str).unwrap_or("info");
            emit(level, &message);
            anyhow::Ok(Value::Null)
        }),
        _ => Arc::new(|payload: Value| async move { anyhow::Ok(payload) }),
    }
}

fn builtin_function(name: &str) -> Arc<dyn JobFunction> {
    match name {
        "sleep" => Arc::new(|arguments: JobArguments| async move {
            let seconds = arguments
                .kwargs
                .get("seconds")
                .or_else(|| arguments.args.first())
                .cloned()
                .unwrap_or(json!(1));
            sleep_for(&seconds).await
        }),
        "log" => Arc::new(|arguments: JobArguments| async move {
            let message = match arguments.kwargs.get("message").and_then(Value::as_str) {
                Some(message) => message.to_string(),
                None => arguments
                    .args
                    .iter()
                    .map(|arg| match arg {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            };
            let level = arguments
                .kwargs
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("info");
            emit(level, &message);
            anyhow::Ok(Value::Null)
        }),
        _ => Arc::new(|arguments: JobArguments| async move {
            anyhow::Ok(json!({"args": arguments.args, "kwargs": arguments.kwargs}))
        }),
    }
}

async fn sleep_for(seconds: &Value) -> Result<Value> {
    let secs = seconds
        .as_f64()
        .ok_or_else(|| anyhow!("seconds 必须是数字: {seconds}"))?;
    if !(0.0..=MAX_SLEEP_SECONDS).contains(&secs) {
        return Err(anyhow!("seconds 超出范围 0-{MAX_SLEEP_SECONDS}: {secs}"));
    }
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    Ok(json!({"slept": secs}))
}

fn emit(level: &str, message: &str) {
    match level.to_lowercase().as_str() {
        "error" => error!(target: "taskflow::builtin", "{}", message),
        "warn" | "warning" => warn!(target: "taskflow::builtin", "{}", message),
        "debug" => debug!(target: "taskflow::builtin", "{}", message),
        _ => info!(target: "taskflow::builtin", "{}", message),
    }
}
