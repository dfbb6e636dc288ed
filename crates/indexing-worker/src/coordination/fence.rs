use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use search_shared::kv::KvStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::scheduler::queues;

use super::repository::CoordinationRepository;

pub const FENCE_PREFIX: &str = "indexing_fence_";
const ACTIVE_PREFIX: &str = "indexing_active_";
/// Default validator grace period; the active signal's TTL is exactly this
/// long, so a fence whose signal keeps getting renewed is left alone.
pub const DEFAULT_ACTIVE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FencePayload {
    pub index_attempt_id: i32,
    pub task_id: Option<String>,
}

fn composite_id(pair_id: i32, search_settings_id: i32) -> String {
    format!("{pair_id}/{search_settings_id}")
}

/// Parse "{pair}/{settings}" out of a fence key.
pub fn parse_fence_key(key: &str) -> Option<(i32, i32)> {
    let composite = key.strip_prefix(FENCE_PREFIX)?;
    let mut parts = composite.split('/');
    let pair_id = parts.next()?.parse().ok()?;
    let settings_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((pair_id, settings_id))
}

/// Ephemeral "pair X is actively indexing under settings Y" markers in the
/// coordination KV.
pub struct FenceManager {
    kv: Arc<dyn KvStore>,
    active_ttl: Duration,
}

impl FenceManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            active_ttl: DEFAULT_ACTIVE_TTL,
        }
    }

    pub fn with_grace_period(kv: Arc<dyn KvStore>, grace_period: Duration) -> Self {
        Self {
            kv,
            active_ttl: grace_period,
        }
    }

    pub fn fence_key(pair_id: i32, search_settings_id: i32) -> String {
        format!("{FENCE_PREFIX}{}", composite_id(pair_id, search_settings_id))
    }

    pub fn active_key(pair_id: i32, search_settings_id: i32) -> String {
        format!("{ACTIVE_PREFIX}{}", composite_id(pair_id, search_settings_id))
    }

    pub async fn set_fence(
        &self,
        pair_id: i32,
        search_settings_id: i32,
        payload: &FencePayload,
    ) -> Result<()> {
        let key = Self::fence_key(pair_id, search_settings_id);
        self.kv
            .set(&key, &serde_json::to_string(payload)?, None)
            .await?;
        // A fresh fence starts with an active signal so the validator gives
        // the task time to reach a worker
        self.set_active(pair_id, search_settings_id).await?;
        Ok(())
    }

    pub async fn get_fence(
        &self,
        pair_id: i32,
        search_settings_id: i32,
    ) -> Result<Option<FencePayload>> {
        let key = Self::fence_key(pair_id, search_settings_id);
        match self.kv.get(&key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn clear_fence(&self, pair_id: i32, search_settings_id: i32) -> Result<()> {
        self.kv
            .delete(&Self::fence_key(pair_id, search_settings_id))
            .await?;
        self.kv
            .delete(&Self::active_key(pair_id, search_settings_id))
            .await?;
        Ok(())
    }

    pub async fn set_active(&self, pair_id: i32, search_settings_id: i32) -> Result<()> {
        self.kv
            .set(
                &Self::active_key(pair_id, search_settings_id),
                "1",
                Some(self.active_ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn is_active(&self, pair_id: i32, search_settings_id: i32) -> Result<bool> {
        self.kv
            .exists(&Self::active_key(pair_id, search_settings_id))
            .await
    }

    pub async fn scan_fences(&self) -> Result<Vec<String>> {
        self.kv.scan(FENCE_PREFIX).await
    }
}

/// Seam for failing an attempt the validator has proven stale.
#[async_trait::async_trait]
pub trait StaleAttemptSink: Send + Sync {
    async fn fail_stale_attempt(&self, attempt_id: i32, reason: &str) -> Result<bool>;
}

#[async_trait::async_trait]
impl StaleAttemptSink for CoordinationRepository {
    async fn fail_stale_attempt(&self, attempt_id: i32, reason: &str) -> Result<bool> {
        Ok(CoordinationRepository::fail_stale_attempt(self, attempt_id, reason).await?)
    }
}

/// Reclaims fences whose tasks have vanished. A task-runtime crash must not
/// leave a (pair, settings) permanently locked.
pub struct FenceValidator {
    fences: Arc<FenceManager>,
    kv: Arc<dyn KvStore>,
    repository: Arc<dyn StaleAttemptSink>,
}

impl FenceValidator {
    pub fn new(
        fences: Arc<FenceManager>,
        kv: Arc<dyn KvStore>,
        repository: Arc<dyn StaleAttemptSink>,
    ) -> Self {
        Self {
            fences,
            kv,
            repository,
        }
    }

    pub async fn validate_all(&self) -> Result<()> {
        for key in self.fences.scan_fences().await? {
            if let Err(e) = self.validate_fence(&key).await {
                warn!("Fence validation failed for {}: {}", key, e);
            }
        }
        Ok(())
    }

    /// The decision sequence: a fence with a live queued task stays; a fence
    /// with a live active signal stays (grace for queue/worker transitions);
    /// anything else is stale, so the attempt is failed and the fence reset.
    pub async fn validate_fence(&self, key: &str) -> Result<()> {
        let Some((pair_id, settings_id)) = parse_fence_key(key) else {
            warn!("Could not parse composite id from fence key {}", key);
            return Ok(());
        };

        let Some(payload) = self.fences.get_fence(pair_id, settings_id).await? else {
            return Ok(());
        };

        let Some(ref task_id) = payload.task_id else {
            // Fence just set up and not yet dispatched; the active signal
            // covers this window
            if self.fences.is_active(pair_id, settings_id).await? {
                return Ok(());
            }
            info!(
                "Resetting fence in basic state without activity: {}",
                key
            );
            self.fences.clear_fence(pair_id, settings_id).await?;
            return Ok(());
        };

        for queue in [queues::CONNECTOR_DOC_FETCHING, queues::USER_FILES_INDEXING] {
            if self.kv.queue_contains(queue, task_id).await? {
                self.fences.set_active(pair_id, settings_id).await?;
                return Ok(());
            }
        }

        if self.fences.is_active(pair_id, settings_id).await? {
            return Ok(());
        }

        warn!(
            "Resetting fence with no associated task: attempt={} pair={} settings={} fence={}",
            payload.index_attempt_id, pair_id, settings_id, key
        );
        let failed = match self
            .repository
            .fail_stale_attempt(
                payload.index_attempt_id,
                &format!(
                    "fence validator: no task found for attempt {}",
                    payload.index_attempt_id
                ),
            )
            .await
        {
            Ok(failed) => failed,
            Err(e) => {
                warn!(
                    "Could not mark attempt {} failed: {}",
                    payload.index_attempt_id, e
                );
                false
            }
        };
        if failed {
            info!(
                "Marked attempt {} failed via fence validation",
                payload.index_attempt_id
            );
        }
        self.fences.clear_fence(pair_id, settings_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_shared::kv::MemoryKv;

    #[test]
    fn test_parse_fence_key() {
        assert_eq!(parse_fence_key("indexing_fence_12/3"), Some((12, 3)));
        assert_eq!(parse_fence_key("indexing_fence_x/3"), None);
        assert_eq!(parse_fence_key("indexing_fence_1/2/3"), None);
        assert_eq!(parse_fence_key("other_key"), None);
    }

    struct RecordingSink {
        failed: tokio::sync::Mutex<Vec<i32>>,
    }

    #[async_trait::async_trait]
    impl StaleAttemptSink for RecordingSink {
        async fn fail_stale_attempt(&self, attempt_id: i32, _reason: &str) -> Result<bool> {
            self.failed.lock().await.push(attempt_id);
            Ok(true)
        }
    }

    async fn validator_setup() -> (Arc<dyn KvStore>, Arc<FenceManager>, Arc<RecordingSink>, FenceValidator)
    {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let fences = Arc::new(FenceManager::new(kv.clone()));
        let sink = Arc::new(RecordingSink {
            failed: tokio::sync::Mutex::new(Vec::new()),
        });
        let validator = FenceValidator::new(fences.clone(), kv.clone(), sink.clone());
        (kv, fences, sink, validator)
    }

    #[tokio::test]
    async fn test_validator_keeps_fence_while_task_queued() {
        let (kv, fences, sink, validator) = validator_setup().await;

        let payload = FencePayload {
            index_attempt_id: 9,
            task_id: Some("docfetching_1_2_t".to_string()),
        };
        fences.set_fence(1, 2, &payload).await.unwrap();
        kv.queue_push(queues::CONNECTOR_DOC_FETCHING, "docfetching_1_2_t")
            .await
            .unwrap();
        // Simulate the active signal having expired
        kv.delete(&FenceManager::active_key(1, 2)).await.unwrap();

        validator.validate_all().await.unwrap();

        assert!(fences.get_fence(1, 2).await.unwrap().is_some());
        assert!(sink.failed.lock().await.is_empty());
        // Seeing the queued task renews the active signal
        assert!(fences.is_active(1, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_validator_reclaims_stale_fence() {
        let (kv, fences, sink, validator) = validator_setup().await;

        let payload = FencePayload {
            index_attempt_id: 11,
            task_id: Some("docfetching_3_4_gone".to_string()),
        };
        fences.set_fence(3, 4, &payload).await.unwrap();
        // No queued task and the active signal has expired
        kv.delete(&FenceManager::active_key(3, 4)).await.unwrap();

        validator.validate_all().await.unwrap();

        assert!(fences.get_fence(3, 4).await.unwrap().is_none());
        assert_eq!(*sink.failed.lock().await, vec![11]);
    }

    #[tokio::test]
    async fn test_validator_grace_period_via_active_signal() {
        let (_kv, fences, sink, validator) = validator_setup().await;

        let payload = FencePayload {
            index_attempt_id: 13,
            task_id: Some("docfetching_5_6_t".to_string()),
        };
        // set_fence sets the active signal; task is not in any queue, which
        // mimics the hand-off window between queue and worker
        fences.set_fence(5, 6, &payload).await.unwrap();

        validator.validate_all().await.unwrap();

        assert!(fences.get_fence(5, 6).await.unwrap().is_some());
        assert!(sink.failed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_fence_roundtrip_and_clear() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let fences = FenceManager::new(kv.clone());

        let payload = FencePayload {
            index_attempt_id: 7,
            task_id: Some("docfetching_1_2_abc".to_string()),
        };
        fences.set_fence(1, 2, &payload).await.unwrap();

        let loaded = fences.get_fence(1, 2).await.unwrap().unwrap();
        assert_eq!(loaded.index_attempt_id, 7);
        assert!(fences.is_active(1, 2).await.unwrap());

        fences.clear_fence(1, 2).await.unwrap();
        assert!(fences.get_fence(1, 2).await.unwrap().is_none());
        assert!(!fences.is_active(1, 2).await.unwrap());
    }
}
