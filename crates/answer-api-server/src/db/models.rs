use chrono::{DateTime, Utc};
use search_shared::llm::{LlmMessage, LlmRole};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "message_type", rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatMessage {
    pub id: i32,
    pub session_id: Uuid,
    pub message_type: MessageType,
    pub message: String,
    pub token_count: i32,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn to_llm_message(&self) -> LlmMessage {
        let role = match self.message_type {
            MessageType::User => LlmRole::User,
            MessageType::Assistant => LlmRole::Assistant,
            MessageType::System => LlmRole::System,
        };
        LlmMessage {
            role,
            content: self.message.clone(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}
