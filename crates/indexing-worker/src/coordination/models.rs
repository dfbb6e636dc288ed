use chrono::{DateTime, Utc};
use search_shared::models::DocumentSource;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "indexing_status", rename_all = "snake_case")]
pub enum IndexingStatus {
    NotStarted,
    InProgress,
    Success,
    Failed,
    Canceled,
}

impl IndexingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexingStatus::Success | IndexingStatus::Failed | IndexingStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "pair_status", rename_all = "snake_case")]
pub enum PairStatus {
    Active,
    Paused,
    Deleting,
}

impl PairStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, PairStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "indexing_trigger", rename_all = "snake_case")]
pub enum IndexingTrigger {
    Update,
    Reindex,
}

/// The unit of ingestion: a connector configuration bound to a credential.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConnectorCredentialPair {
    pub id: i32,
    pub name: String,
    pub source: DocumentSource,
    pub connector_config: sqlx::types::Json<serde_json::Value>,
    pub credentials: sqlx::types::Json<serde_json::Value>,
    pub status: PairStatus,
    /// Seconds between refreshes; None disables scheduled reindexing.
    pub refresh_freq: Option<i64>,
    pub last_time_perm_sync: Option<DateTime<Utc>>,
    pub indexing_trigger: Option<IndexingTrigger>,
    pub is_user_file: bool,
    pub repeated_error_count: i32,
    pub in_repeated_error_state: bool,
}

/// One execution of indexing for a (pair, search-settings) combination.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IndexAttempt {
    pub id: i32,
    pub connector_credential_pair_id: i32,
    pub search_settings_id: i32,
    pub status: IndexingStatus,
    pub from_beginning: bool,
    pub task_id: Option<String>,
    pub error_msg: Option<String>,
    pub total_docs_indexed: i32,
    pub total_chunks: i32,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
}
