pub mod diesel_pool;
pub mod kv;
pub mod redis_config;
pub mod redis_pool;

pub use diesel_pool::{
    check_diesel_health, create_diesel_pool, mask_connection_string, DieselPool, MirrorDbConfig,
};
pub use kv::{KeyValueStore, KvError, KvOp, KvPipelineResult, MemoryKvStore, RedisKvStore};
pub use redis_config::RedisPoolConfig;
pub use redis_pool::{RedisHealth, RedisPool, RedisPoolMetrics};
