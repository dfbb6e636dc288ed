use search_shared::text::count_tokens;
use sqlx::PgPool;
use uuid::Uuid;

use crate::utils::error::ApiError;

use super::models::{ChatMessage, ChatSession, MessageType};

pub struct ChatRepository {
    pool: PgPool,
}

impl ChatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get_or_create_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        user_email: Option<&str>,
    ) -> Result<ChatSession, ApiError> {
        if let Some(session) = sqlx::query_as::<_, ChatSession>(
            r#"SELECT * FROM chat_session WHERE id = $1"#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(session);
        }

        Ok(sqlx::query_as::<_, ChatSession>(
            r#"
            INSERT INTO chat_session (id, user_id, user_email, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(user_email)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn save_message(
        &self,
        session_id: Uuid,
        message_type: MessageType,
        message: &str,
    ) -> Result<ChatMessage, ApiError> {
        let token_count = count_tokens(message) as i32;
        Ok(sqlx::query_as::<_, ChatMessage>(
            r#"
            INSERT INTO chat_message (session_id, message_type, message, token_count, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(message_type)
        .bind(message)
        .bind(token_count)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn messages_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        Ok(sqlx::query_as::<_, ChatMessage>(
            r#"SELECT * FROM chat_message WHERE session_id = $1 ORDER BY id"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn save_cited_docs(
        &self,
        message_id: i32,
        doc_ids: &[String],
    ) -> Result<(), ApiError> {
        for doc_id in doc_ids {
            sqlx::query(
                r#"
                INSERT INTO chat_message_cited_doc (message_id, doc_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(message_id)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
