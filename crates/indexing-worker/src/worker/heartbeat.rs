use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use search_shared::kv::{KvStore, Lease};
use tracing::{error, warn};

use crate::connectors::IndexingHeartbeat;
use crate::coordination::FenceManager;

/// Heartbeat backed by the coordination KV. Progress calls renew the
/// attempt lease and the fence's active signal; losing the lease flips the
/// stop flag so the connector aborts instead of double processing.
pub struct KvHeartbeat {
    kv: Arc<dyn KvStore>,
    fences: Arc<FenceManager>,
    pair_id: i32,
    search_settings_id: i32,
    stop_key: String,
    progress_key: String,
    lease: tokio::sync::Mutex<Option<Lease>>,
    lease_lost: AtomicBool,
}

impl KvHeartbeat {
    pub fn stop_key(pair_id: i32, search_settings_id: i32) -> String {
        format!("indexing_stop_{pair_id}/{search_settings_id}")
    }

    pub fn progress_key(pair_id: i32, search_settings_id: i32) -> String {
        format!("indexing_progress_{pair_id}/{search_settings_id}")
    }

    pub fn new(
        kv: Arc<dyn KvStore>,
        fences: Arc<FenceManager>,
        pair_id: i32,
        search_settings_id: i32,
        lease: Lease,
    ) -> Self {
        Self {
            stop_key: Self::stop_key(pair_id, search_settings_id),
            progress_key: Self::progress_key(pair_id, search_settings_id),
            kv,
            fences,
            pair_id,
            search_settings_id,
            lease: tokio::sync::Mutex::new(Some(lease)),
            lease_lost: AtomicBool::new(false),
        }
    }

    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexingHeartbeat for KvHeartbeat {
    async fn should_stop(&self) -> bool {
        if self.lease_lost() {
            return true;
        }
        match self.kv.exists(&self.stop_key).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!("Stop-key check failed: {}", e);
                false
            }
        }
    }

    async fn progress(&self, tag: &str, amount: i64) {
        if let Err(e) = self.kv.incr_by(&self.progress_key, amount).await {
            warn!("Progress increment failed ({}): {}", tag, e);
        }

        let lease_guard = self.lease.lock().await;
        if let Some(ref lease) = *lease_guard {
            if let Err(e) = lease.reacquire().await {
                error!(
                    "Lease reacquire failed for pair {} settings {}: {}; aborting attempt",
                    self.pair_id, self.search_settings_id, e
                );
                self.lease_lost.store(true, Ordering::SeqCst);
                return;
            }
        }
        drop(lease_guard);

        if let Err(e) = self
            .fences
            .set_active(self.pair_id, self.search_settings_id)
            .await
        {
            warn!("Active-signal renewal failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_shared::kv::MemoryKv;
    use std::time::Duration;

    async fn heartbeat_with_lease(ttl: Duration) -> (Arc<dyn KvStore>, KvHeartbeat) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let fences = Arc::new(FenceManager::new(kv.clone()));
        let lease = Lease::acquire(kv.clone(), "indexing_lease_1/2", ttl)
            .await
            .unwrap()
            .unwrap();
        let hb = KvHeartbeat::new(kv.clone(), fences, 1, 2, lease);
        (kv, hb)
    }

    #[tokio::test]
    async fn test_stop_key_triggers_should_stop() {
        let (kv, hb) = heartbeat_with_lease(Duration::from_secs(30)).await;
        assert!(!hb.should_stop().await);

        kv.set(&KvHeartbeat::stop_key(1, 2), "1", None).await.unwrap();
        assert!(hb.should_stop().await);
    }

    #[tokio::test]
    async fn test_progress_accumulates_and_renews_active() {
        let (kv, hb) = heartbeat_with_lease(Duration::from_secs(30)).await;
        hb.progress("batch", 5).await;
        hb.progress("batch", 3).await;

        let total: i64 = kv
            .get(&KvHeartbeat::progress_key(1, 2))
            .await
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(total, 8);
        assert!(kv.exists(&FenceManager::active_key(1, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_lease_forces_stop() {
        let (_kv, hb) = heartbeat_with_lease(Duration::from_millis(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        hb.progress("batch", 1).await;
        assert!(hb.lease_lost());
        assert!(hb.should_stop().await);
    }
}
