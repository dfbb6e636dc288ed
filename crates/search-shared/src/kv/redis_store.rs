use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::KvStore;

/// Redis-backed coordination store. All callers share one connection
/// manager; redis multiplexes commands over it.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let response: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(response.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(&pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, amount).await?)
    }

    async fn queue_push(&self, queue: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(queue, value).await?;
        Ok(())
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lpop(queue, None).await?)
    }

    async fn queue_contains(&self, queue: &str, needle: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(queue, 0, -1).await?;
        Ok(items.iter().any(|item| item == needle))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(queue).await?;
        Ok(len.max(0) as usize)
    }
}
