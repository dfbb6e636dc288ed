use chrono::{DateTime, Utc};
use search_shared::models::{SearchSettings, SearchSettingsStatus};
use sqlx::PgPool;
use tracing::info;

use crate::utils::error::WorkerError;

use super::models::{ConnectorCredentialPair, IndexAttempt};

/// DB-backed coordination over pairs, search settings and index attempts.
pub struct CoordinationRepository {
    pool: PgPool,
}

impl CoordinationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get_pair(&self, pair_id: i32) -> Result<ConnectorCredentialPair, WorkerError> {
        sqlx::query_as::<_, ConnectorCredentialPair>(
            r#"SELECT * FROM connector_credential_pair WHERE id = $1"#,
        )
        .bind(pair_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(WorkerError::PairNotFound(pair_id))
    }

    pub async fn pairs_for_scheduling(&self) -> Result<Vec<ConnectorCredentialPair>, WorkerError> {
        Ok(sqlx::query_as::<_, ConnectorCredentialPair>(
            r#"SELECT * FROM connector_credential_pair WHERE status != 'deleting' ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn current_search_settings(&self) -> Result<SearchSettings, WorkerError> {
        sqlx::query_as::<_, SearchSettings>(
            r#"SELECT * FROM search_settings WHERE status = 'present' ORDER BY id DESC LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| WorkerError::Coordination("no PRESENT search settings".to_string()))
    }

    /// PRESENT settings plus the FUTURE one while a model swap is indexing.
    pub async fn schedulable_search_settings(&self) -> Result<Vec<SearchSettings>, WorkerError> {
        Ok(sqlx::query_as::<_, SearchSettings>(
            r#"SELECT * FROM search_settings WHERE status IN ('present', 'future') ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn secondary_index_building(&self) -> Result<bool, WorkerError> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM search_settings WHERE status = 'future'"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Atomically create a new attempt unless one is already active for the
    /// (pair, settings) combination. None means somebody else holds it.
    pub async fn try_create_index_attempt(
        &self,
        pair_id: i32,
        search_settings_id: i32,
        task_id: &str,
        from_beginning: bool,
    ) -> Result<Option<i32>, WorkerError> {
        let attempt_id: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO index_attempt
                (connector_credential_pair_id, search_settings_id, status,
                 from_beginning, task_id, total_docs_indexed, total_chunks,
                 time_created, time_updated)
            SELECT $1, $2, 'not_started', $3, $4, 0, 0, NOW(), NOW()
            WHERE NOT EXISTS (
                SELECT 1 FROM index_attempt
                WHERE connector_credential_pair_id = $1
                  AND search_settings_id = $2
                  AND status IN ('not_started', 'in_progress')
            )
            RETURNING id
            "#,
        )
        .bind(pair_id)
        .bind(search_settings_id)
        .bind(from_beginning)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = attempt_id {
            info!(
                "Created index attempt {} for pair {} settings {}",
                id, pair_id, search_settings_id
            );
        }
        Ok(attempt_id)
    }

    pub async fn get_attempt(&self, attempt_id: i32) -> Result<IndexAttempt, WorkerError> {
        sqlx::query_as::<_, IndexAttempt>(r#"SELECT * FROM index_attempt WHERE id = $1"#)
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(WorkerError::AttemptNotFound(attempt_id))
    }

    pub async fn last_attempt_for(
        &self,
        pair_id: i32,
        search_settings_id: i32,
    ) -> Result<Option<IndexAttempt>, WorkerError> {
        Ok(sqlx::query_as::<_, IndexAttempt>(
            r#"
            SELECT * FROM index_attempt
            WHERE connector_credential_pair_id = $1 AND search_settings_id = $2
            ORDER BY time_created DESC LIMIT 1
            "#,
        )
        .bind(pair_id)
        .bind(search_settings_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn last_successful_attempt_for(
        &self,
        pair_id: i32,
        search_settings_id: i32,
    ) -> Result<Option<IndexAttempt>, WorkerError> {
        Ok(sqlx::query_as::<_, IndexAttempt>(
            r#"
            SELECT * FROM index_attempt
            WHERE connector_credential_pair_id = $1 AND search_settings_id = $2
              AND status = 'success'
            ORDER BY time_created DESC LIMIT 1
            "#,
        )
        .bind(pair_id)
        .bind(search_settings_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn active_attempts_for(
        &self,
        pair_id: i32,
    ) -> Result<Vec<IndexAttempt>, WorkerError> {
        Ok(sqlx::query_as::<_, IndexAttempt>(
            r#"
            SELECT * FROM index_attempt
            WHERE connector_credential_pair_id = $1
              AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(pair_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn mark_started(&self, attempt_id: i32) -> Result<(), WorkerError> {
        sqlx::query(
            r#"UPDATE index_attempt SET status = 'in_progress', time_updated = NOW() WHERE id = $1"#,
        )
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, attempt_id: i32, reason: &str) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            UPDATE index_attempt
            SET status = 'failed', error_msg = $2, time_updated = NOW()
            WHERE id = $1 AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(attempt_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_canceled(&self, attempt_id: i32, reason: &str) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            UPDATE index_attempt
            SET status = 'canceled', error_msg = $2, time_updated = NOW()
            WHERE id = $1 AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(attempt_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_succeeded(
        &self,
        attempt_id: i32,
        docs_indexed: i32,
        chunks_indexed: i32,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            UPDATE index_attempt
            SET status = 'success', total_docs_indexed = $2, total_chunks = $3,
                time_updated = NOW()
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .bind(docs_indexed)
        .bind(chunks_indexed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        attempt_id: i32,
        docs_indexed: i32,
        chunks_indexed: i32,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            UPDATE index_attempt
            SET total_docs_indexed = $2, total_chunks = $3, time_updated = NOW()
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .bind(docs_indexed)
        .bind(chunks_indexed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_indexing_trigger(&self, pair_id: i32) -> Result<(), WorkerError> {
        sqlx::query(r#"UPDATE connector_credential_pair SET indexing_trigger = NULL WHERE id = $1"#)
            .bind(pair_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump the consecutive-failure counter; entering the repeated-error
    /// state happens at the caller-supplied threshold.
    pub async fn record_attempt_failure(
        &self,
        pair_id: i32,
        threshold: i32,
    ) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            UPDATE connector_credential_pair
            SET repeated_error_count = repeated_error_count + 1,
                in_repeated_error_state = (repeated_error_count + 1 >= $2)
            WHERE id = $1
            "#,
        )
        .bind(pair_id)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_repeated_errors(&self, pair_id: i32) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            UPDATE connector_credential_pair
            SET repeated_error_count = 0, in_repeated_error_state = FALSE
            WHERE id = $1
            "#,
        )
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_last_perm_sync(
        &self,
        pair_id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        sqlx::query(r#"UPDATE connector_credential_pair SET last_time_perm_sync = $2 WHERE id = $1"#)
            .bind(pair_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Force-fail any attempt stuck in a non-terminal state (used by the
    /// fence validator, which has already proven the task is gone).
    pub async fn fail_stale_attempt(
        &self,
        attempt_id: i32,
        reason: &str,
    ) -> Result<bool, WorkerError> {
        let result = sqlx::query(
            r#"
            UPDATE index_attempt
            SET status = 'failed', error_msg = $2, time_updated = NOW()
            WHERE id = $1 AND status IN ('not_started', 'in_progress')
            "#,
        )
        .bind(attempt_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
