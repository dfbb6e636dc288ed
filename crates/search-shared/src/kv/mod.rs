pub mod lease;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use lease::Lease;
pub use memory::MemoryKv;
pub use redis_store::RedisKv;

/// Key-value store with TTLs used for ephemeral coordination state (fences,
/// active signals, function locks) and the distributed task queue.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Set only if the key does not exist; returns whether the write won.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64>;

    // Task queue primitives (FIFO lists keyed by queue name)
    async fn queue_push(&self, queue: &str, value: &str) -> Result<()>;
    async fn queue_pop(&self, queue: &str) -> Result<Option<String>>;
    async fn queue_contains(&self, queue: &str, needle: &str) -> Result<bool>;
    async fn queue_len(&self, queue: &str) -> Result<usize>;
}
