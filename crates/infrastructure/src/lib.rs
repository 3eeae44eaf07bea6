pub mod in_memory_store;
pub mod observability;
pub mod redis_store;
pub mod store_factory;

pub use in_memory_store::InMemoryStore;
pub use observability::{
    init_logging, init_metrics, LoggingConfig, MetricsCollector, StructuredLogger,
};
pub use redis_store::RedisStore;
pub use store_factory::StoreFactory;
