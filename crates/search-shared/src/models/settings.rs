use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an embedding-model configuration. Exactly one PRESENT at a
/// time; FUTURE exists only while a model swap is being indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "search_settings_status", rename_all = "snake_case")]
pub enum SearchSettingsStatus {
    Present,
    Future,
    Past,
}

/// Versioned embedding model + tokenizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SearchSettings {
    pub id: i32,
    pub model_name: String,
    pub model_dim: i32,
    pub max_seq_length: i32,
    pub status: SearchSettingsStatus,
    pub time_created: DateTime<Utc>,
}

impl SearchSettings {
    pub fn is_present(&self) -> bool {
        self.status == SearchSettingsStatus::Present
    }

    pub fn is_future(&self) -> bool {
        self.status == SearchSettingsStatus::Future
    }
}
