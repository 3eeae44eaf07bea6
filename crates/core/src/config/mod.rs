//! 配置管理
//!
//! [`AppConfig`] 汇总各配置段，通过 `config` crate 从TOML文件与
//! `TASKFLOW_` 前缀的环境变量加载。每个配置段提供 `validate()`，
//! 加载完成后统一校验。
//!
//! ```toml
//! [store]
//! type = "redis"
//! key_prefix = "taskflow"
//!
//! [store.redis]
//! host = "127.0.0.1"
//! port = 6379
//!
//! [[worker.queues]]
//! name = "default"
//! workers = 4
//!
//! [[scheduler.jobs]]
//! name = "heartbeat"
//! function = "log"
//! trigger = { type = "interval", seconds = 30 }
//! ```

pub mod models;

pub use models::*;
