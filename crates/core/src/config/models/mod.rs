pub mod app_config;
pub mod observability;
pub mod queue_worker;
pub mod scheduler;
pub mod store;

pub use app_config::{AppConfig, DEFAULT_CONFIG_PATHS};
pub use observability::{LogFormat, ObservabilityConfig};
pub use queue_worker::{QueueConfig, QueueWorkers, WorkerConfig};
pub use scheduler::{JobDefinition, SchedulerConfig};
pub use store::{RedisConfig, StoreConfig, StoreType};
