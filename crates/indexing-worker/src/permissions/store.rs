use search_shared::models::DocExternalAccess;
use sqlx::PgPool;

use crate::utils::error::WorkerError;

/// Durable DocExternalAccess snapshots; latest write per doc id wins.
pub struct PermissionStore {
    pool: PgPool,
}

impl PermissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, record: &DocExternalAccess) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            INSERT INTO doc_external_access
                (doc_id, external_user_emails, external_user_group_ids, is_public, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (doc_id) DO UPDATE SET
                external_user_emails = EXCLUDED.external_user_emails,
                external_user_group_ids = EXCLUDED.external_user_group_ids,
                is_public = EXCLUDED.is_public,
                updated_at = NOW()
            "#,
        )
        .bind(&record.doc_id)
        .bind(
            record
                .external_access
                .external_user_emails
                .iter()
                .cloned()
                .collect::<Vec<String>>(),
        )
        .bind(
            record
                .external_access
                .external_user_group_ids
                .iter()
                .cloned()
                .collect::<Vec<String>>(),
        )
        .bind(record.external_access.is_public)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Distinct external group ids currently referenced by any document,
    /// filtered by prefix (e.g. the synthetic drive_folder groups).
    pub async fn group_ids_with_prefix(&self, prefix: &str) -> Result<Vec<String>, WorkerError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT unnest(external_user_group_ids) AS group_id
            FROM doc_external_access
            WHERE EXISTS (
                SELECT 1 FROM unnest(external_user_group_ids) g WHERE g LIKE $1 || '%'
            )
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter(|g| g.starts_with(prefix)).collect())
    }

    /// Replace the member list of an external group.
    pub async fn upsert_group(
        &self,
        group_id: &str,
        member_emails: &[String],
    ) -> Result<(), WorkerError> {
        sqlx::query(
            r#"
            INSERT INTO external_user_group (group_id, member_emails, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (group_id) DO UPDATE SET
                member_emails = EXCLUDED.member_emails,
                updated_at = NOW()
            "#,
        )
        .bind(group_id)
        .bind(member_emails)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
