use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use uuid::Uuid;

use super::KvStore;

/// Short-TTL exclusive lease over a KV key. A worker that fails to reacquire
/// must abort its work rather than risk double processing.
pub struct Lease {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
    ttl: Duration,
}

impl Lease {
    /// Try to take the lease; None if somebody else holds it.
    pub async fn acquire(kv: Arc<dyn KvStore>, key: &str, ttl: Duration) -> Result<Option<Lease>> {
        let token = Uuid::new_v4().to_string();
        let won = kv.set_nx(key, &token, Some(ttl)).await?;
        if !won {
            return Ok(None);
        }
        Ok(Some(Lease {
            kv,
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    /// Extend the lease. Errors if the key expired or was taken over, in
    /// which case the holder must stop.
    pub async fn reacquire(&self) -> Result<()> {
        match self.kv.get(&self.key).await? {
            Some(current) if current == self.token => {
                self.kv.expire(&self.key, self.ttl).await?;
                Ok(())
            }
            Some(_) => Err(anyhow!("lease {} taken over by another holder", self.key)),
            None => Err(anyhow!("lease {} expired before reacquire", self.key)),
        }
    }

    pub async fn release(self) -> Result<()> {
        // Only delete if we still own it
        if let Some(current) = self.kv.get(&self.key).await? {
            if current == self.token {
                self.kv.delete(&self.key).await?;
            }
        }
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let lease = Lease::acquire(kv.clone(), "lock:test", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(lease.is_some());

        let second = Lease::acquire(kv.clone(), "lock:test", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none());

        lease.unwrap().release().await.unwrap();
        let third = Lease::acquire(kv, "lock:test", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_reacquire_fails_after_expiry() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let lease = Lease::acquire(kv.clone(), "lock:exp", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lease.reacquire().await.is_err());
    }
}
