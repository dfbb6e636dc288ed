use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::KvStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Instant::now()).unwrap_or(false)
    }
}

/// In-process KV used by tests and single-node development runs. Mirrors the
/// redis-backed store's TTL semantics closely enough for scheduler and
/// coordination tests.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).map(|e| !e.is_expired()).unwrap_or(false))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let live = entries.get(key).map(|e| !e.is_expired()).unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + amount;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn queue_push(&self, queue: &str, value: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>> {
        let mut queues = self.queues.lock().await;
        Ok(queues.get_mut(queue).and_then(|q| q.pop_front()))
    }

    async fn queue_contains(&self, queue: &str, needle: &str) -> Result<bool> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|q| q.iter().any(|item| item == needle))
            .unwrap_or(false))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|q| q.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_second_write_loses() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("lock", "a", None).await.unwrap());
        assert!(!kv.set_nx("lock", "b", None).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_keys_are_invisible() {
        let kv = MemoryKv::new();
        kv.set("gone", "v", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!kv.exists("gone").await.unwrap());
        assert!(kv.set_nx("gone", "again", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_fifo_order() {
        let kv = MemoryKv::new();
        kv.queue_push("q", "one").await.unwrap();
        kv.queue_push("q", "two").await.unwrap();
        assert!(kv.queue_contains("q", "two").await.unwrap());
        assert_eq!(kv.queue_pop("q").await.unwrap().as_deref(), Some("one"));
        assert_eq!(kv.queue_pop("q").await.unwrap().as_deref(), Some("two"));
        assert_eq!(kv.queue_pop("q").await.unwrap(), None);
    }
}
