use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use search_shared::kv::{KvStore, Lease};
use search_shared::models::{DocumentSource, SearchSettings};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::coordination::{
    ConnectorCredentialPair, CoordinationRepository, FenceManager, FencePayload, FenceValidator,
    IndexAttempt, IndexingStatus, IndexingTrigger,
};
use crate::utils::error::WorkerError;

pub mod queues {
    pub const CONNECTOR_DOC_FETCHING: &str = "queue:connector_doc_fetching";
    pub const USER_FILES_INDEXING: &str = "queue:user_files_indexing";
}

const CREATE_TASK_LOCK_KEY: &str = "lock:try_create_indexing_task";
const CREATE_TASK_LOCK_TTL: Duration = Duration::from_secs(30);

pub const NUM_REPEAT_ERRORS_BEFORE_REPEATED_ERROR_STATE: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

/// The message workers pop off the distributed queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingTask {
    pub task_id: String,
    pub index_attempt_id: i32,
    pub pair_id: i32,
    pub search_settings_id: i32,
    pub priority: TaskPriority,
}

/// The per-tick decision: should this (pair, settings) combination be
/// (re)indexed right now? Tactical overlap checks are not handled here;
/// attempt creation enforces at-most-one.
pub fn should_index(
    pair: &ConnectorCredentialPair,
    last_attempt: Option<&IndexAttempt>,
    settings: &SearchSettings,
    now: DateTime<Utc>,
) -> bool {
    if pair.source == DocumentSource::NotApplicable {
        return false;
    }

    // When switching embedding models, the future settings must index at
    // least once or the swap can never complete
    if settings.is_future() {
        if let Some(last) = last_attempt {
            if last.status == IndexingStatus::Success {
                return false;
            }
            if last.status == IndexingStatus::NotStarted {
                return false;
            }
            if last.status == IndexingStatus::InProgress {
                return false;
            }
        } else if pair.source == DocumentSource::IngestionApi {
            return false;
        }
        return true;
    }

    if pair.source == DocumentSource::IngestionApi {
        return false;
    }

    // A manual trigger on the primary settings wins even while the pair is
    // paused
    if settings.is_present() && pair.indexing_trigger.is_some() {
        return true;
    }

    if !pair.status.is_active() {
        return false;
    }

    let Some(last) = last_attempt else {
        // Never indexed: go regardless of refresh_freq
        return true;
    };

    let Some(refresh_freq) = pair.refresh_freq else {
        return false;
    };

    let since_last = now.signed_duration_since(last.time_updated);
    if since_last.num_seconds() < refresh_freq {
        return false;
    }

    true
}

/// Creates the attempt row, the fence, and the queue entry for one (pair,
/// settings). Serialized through a short-lived KV lock because both the
/// beat and manual triggers call in here.
pub struct TaskDispatcher {
    repository: Arc<CoordinationRepository>,
    kv: Arc<dyn KvStore>,
    fences: Arc<FenceManager>,
}

impl TaskDispatcher {
    pub fn new(
        repository: Arc<CoordinationRepository>,
        kv: Arc<dyn KvStore>,
        fences: Arc<FenceManager>,
    ) -> Self {
        Self {
            repository,
            kv,
            fences,
        }
    }

    pub async fn try_create_docfetching_task(
        &self,
        pair: &ConnectorCredentialPair,
        settings: &SearchSettings,
        reindex: bool,
    ) -> Result<Option<i32>, WorkerError> {
        let Some(lock) = Lease::acquire(self.kv.clone(), CREATE_TASK_LOCK_KEY, CREATE_TASK_LOCK_TTL)
            .await
            .map_err(|e| WorkerError::Coordination(e.to_string()))?
        else {
            debug!("Task creation lock busy, skipping pair {}", pair.id);
            return Ok(None);
        };

        let result = self.create_locked(pair, settings, reindex).await;

        if let Err(e) = lock.release().await {
            warn!("Failed to release task creation lock: {}", e);
        }
        result
    }

    async fn create_locked(
        &self,
        pair: &ConnectorCredentialPair,
        settings: &SearchSettings,
        reindex: bool,
    ) -> Result<Option<i32>, WorkerError> {
        // Status may have changed since the scheduler snapshot
        let fresh_pair = self.repository.get_pair(pair.id).await?;
        if fresh_pair.status == crate::coordination::PairStatus::Deleting {
            return Ok(None);
        }

        let task_id = format!("docfetching_{}_{}_{}", pair.id, settings.id, Uuid::new_v4());

        let Some(attempt_id) = self
            .repository
            .try_create_index_attempt(pair.id, settings.id, &task_id, reindex)
            .await?
        else {
            // Another attempt is already running for this combination
            return Ok(None);
        };

        let dispatch_result = self.dispatch(pair, settings, attempt_id, &task_id).await;
        if let Err(e) = dispatch_result {
            // Anything that failed after attempt creation must not leave the
            // attempt dangling
            error!(
                "Dispatch failed for attempt {} (pair {}): {}",
                attempt_id, pair.id, e
            );
            self.repository
                .mark_failed(attempt_id, &format!("dispatch failed: {e}"))
                .await?;
            self.fences
                .clear_fence(pair.id, settings.id)
                .await
                .map_err(|e| WorkerError::Coordination(e.to_string()))?;
            return Ok(None);
        }

        info!(
            "Created docfetching task: pair={} settings={} attempt={} task_id={}",
            pair.id, settings.id, attempt_id, task_id
        );
        Ok(Some(attempt_id))
    }

    async fn dispatch(
        &self,
        pair: &ConnectorCredentialPair,
        settings: &SearchSettings,
        attempt_id: i32,
        task_id: &str,
    ) -> Result<(), WorkerError> {
        self.fences
            .set_fence(
                pair.id,
                settings.id,
                &FencePayload {
                    index_attempt_id: attempt_id,
                    task_id: Some(task_id.to_string()),
                },
            )
            .await
            .map_err(|e| WorkerError::Coordination(e.to_string()))?;

        let queue = if pair.is_user_file {
            queues::USER_FILES_INDEXING
        } else {
            queues::CONNECTOR_DOC_FETCHING
        };

        let task = IndexingTask {
            task_id: task_id.to_string(),
            index_attempt_id: attempt_id,
            pair_id: pair.id,
            search_settings_id: settings.id,
            priority: TaskPriority::Medium,
        };
        self.kv
            .queue_push(
                queue,
                &serde_json::to_string(&task)
                    .map_err(|e| WorkerError::Coordination(e.to_string()))?,
            )
            .await
            .map_err(|e| WorkerError::Coordination(e.to_string()))?;
        Ok(())
    }
}

/// The fixed-beat loop: evaluate every (pair, settings), dispatch what is
/// due, and run fence validation.
pub struct IndexingScheduler {
    repository: Arc<CoordinationRepository>,
    dispatcher: TaskDispatcher,
    validator: FenceValidator,
    beat_interval: Duration,
}

impl IndexingScheduler {
    pub fn new(
        repository: Arc<CoordinationRepository>,
        dispatcher: TaskDispatcher,
        validator: FenceValidator,
        settings: &Settings,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            validator,
            beat_interval: Duration::from_secs(settings.scheduler.beat_interval_seconds),
        }
    }

    pub async fn run(self) {
        info!("Indexing scheduler started");
        let mut interval = tokio::time::interval(self.beat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!("Scheduler tick failed: {}", e);
            }
            if let Err(e) = self.validator.validate_all().await {
                error!("Fence validation failed: {}", e);
            }
        }
    }

    pub async fn tick(&self) -> Result<(), WorkerError> {
        let pairs = self.repository.pairs_for_scheduling().await?;
        let settings_list = self.repository.schedulable_search_settings().await?;
        let now = Utc::now();

        for pair in &pairs {
            for settings in &settings_list {
                let last_attempt = self
                    .repository
                    .last_attempt_for(pair.id, settings.id)
                    .await?;

                if !should_index(pair, last_attempt.as_ref(), settings, now) {
                    continue;
                }

                let reindex = pair.indexing_trigger == Some(IndexingTrigger::Reindex);
                match self
                    .dispatcher
                    .try_create_docfetching_task(pair, settings, reindex)
                    .await
                {
                    Ok(Some(_)) => {
                        if settings.is_present() && pair.indexing_trigger.is_some() {
                            self.repository.clear_indexing_trigger(pair.id).await?;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Failed to create task for pair {}: {}", pair.id, e);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::PairStatus;
    use search_shared::models::SearchSettingsStatus;

    fn pair(status: PairStatus, refresh_freq: Option<i64>) -> ConnectorCredentialPair {
        ConnectorCredentialPair {
            id: 1,
            name: "test".to_string(),
            source: DocumentSource::Web,
            connector_config: sqlx::types::Json(serde_json::json!({})),
            credentials: sqlx::types::Json(serde_json::json!({})),
            status,
            refresh_freq,
            last_time_perm_sync: None,
            indexing_trigger: None,
            is_user_file: false,
            repeated_error_count: 0,
            in_repeated_error_state: false,
        }
    }

    fn settings(status: SearchSettingsStatus) -> SearchSettings {
        SearchSettings {
            id: 10,
            model_name: "embedder".to_string(),
            model_dim: 768,
            max_seq_length: 512,
            status,
            time_created: Utc::now(),
        }
    }

    fn attempt(status: IndexingStatus, updated_secs_ago: i64, now: DateTime<Utc>) -> IndexAttempt {
        IndexAttempt {
            id: 100,
            connector_credential_pair_id: 1,
            search_settings_id: 10,
            status,
            from_beginning: false,
            task_id: None,
            error_msg: None,
            total_docs_indexed: 0,
            total_chunks: 0,
            time_created: now - chrono::Duration::seconds(updated_secs_ago + 60),
            time_updated: now - chrono::Duration::seconds(updated_secs_ago),
        }
    }

    #[test]
    fn test_not_applicable_source_skipped() {
        let mut p = pair(PairStatus::Active, Some(3600));
        p.source = DocumentSource::NotApplicable;
        assert!(!should_index(
            &p,
            None,
            &settings(SearchSettingsStatus::Present),
            Utc::now()
        ));
    }

    #[test]
    fn test_refresh_freq_gates_reindex() {
        let now = Utc::now();
        let p = pair(PairStatus::Active, Some(3600));
        let s = settings(SearchSettingsStatus::Present);

        // 1200 seconds since last success with refresh_freq 3600: skip
        let recent = attempt(IndexingStatus::Success, 1200, now);
        assert!(!should_index(&p, Some(&recent), &s, now));

        // 3700 seconds: index now
        let stale = attempt(IndexingStatus::Success, 3700, now);
        assert!(should_index(&p, Some(&stale), &s, now));
    }

    #[test]
    fn test_no_prior_attempt_indexes_regardless_of_refresh_freq() {
        let p = pair(PairStatus::Active, None);
        assert!(should_index(
            &p,
            None,
            &settings(SearchSettingsStatus::Present),
            Utc::now()
        ));
    }

    #[test]
    fn test_null_refresh_freq_skips_after_first_index() {
        let now = Utc::now();
        let p = pair(PairStatus::Active, None);
        let last = attempt(IndexingStatus::Success, 999_999, now);
        assert!(!should_index(
            &p,
            Some(&last),
            &settings(SearchSettingsStatus::Present),
            now
        ));
    }

    #[test]
    fn test_paused_pair_needs_manual_trigger() {
        let now = Utc::now();
        let mut p = pair(PairStatus::Paused, Some(60));
        let s = settings(SearchSettingsStatus::Present);
        assert!(!should_index(&p, None, &s, now));

        p.indexing_trigger = Some(IndexingTrigger::Update);
        assert!(should_index(&p, None, &s, now));
    }

    #[test]
    fn test_future_settings_index_exactly_once() {
        let now = Utc::now();
        let p = pair(PairStatus::Active, Some(3600));
        let s = settings(SearchSettingsStatus::Future);

        // Never attempted under the future model: index
        assert!(should_index(&p, None, &s, now));

        // Succeeded once: never again (the swap takes it from here)
        let done = attempt(IndexingStatus::Success, 10, now);
        assert!(!should_index(&p, Some(&done), &s, now));

        // In flight: wait
        let running = attempt(IndexingStatus::InProgress, 10, now);
        assert!(!should_index(&p, Some(&running), &s, now));

        // Failed: retry
        let failed = attempt(IndexingStatus::Failed, 10, now);
        assert!(should_index(&p, Some(&failed), &s, now));
    }

    #[test]
    fn test_future_settings_bypass_pause() {
        let now = Utc::now();
        let p = pair(PairStatus::Paused, Some(3600));
        let s = settings(SearchSettingsStatus::Future);
        assert!(should_index(&p, None, &s, now));
    }
}
