use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub kv: KvConfig,
    pub index_engine: IndexEngineConfig,
    pub embedding: EmbeddingConfig,
    pub image_server: ImageServerConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KvConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexEngineConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub batch_size: usize,
    pub timeout_seconds: u64,
    /// Tokens held back from the model's max sequence length when chunking.
    pub chunk_token_buffer: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImageServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    pub beat_interval_seconds: u64,
    pub permission_beat_interval_seconds: u64,
    /// How long a fence may outlive its queued task before the validator
    /// reclaims it.
    pub fence_grace_period_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub continue_on_connector_failure: bool,
    pub index_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectorsConfig {
    pub attachment_size_limit_bytes: u64,
    pub salesforce_max_parallelism: usize,
    pub freshdesk_retry_interval_seconds: u64,
    pub web_max_pages: usize,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/search".to_string(),
                pool_max_size: 10,
                pool_timeout_seconds: 30,
            },
            kv: KvConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            index_engine: IndexEngineConfig {
                base_url: "http://127.0.0.1:8081".to_string(),
                timeout_seconds: 60,
            },
            embedding: EmbeddingConfig {
                base_url: "http://127.0.0.1:8090".to_string(),
                batch_size: 32,
                timeout_seconds: 60,
                chunk_token_buffer: 64,
            },
            image_server: ImageServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8500,
                timeout_seconds: 120,
                enabled: false,
            },
            scheduler: SchedulerConfig {
                beat_interval_seconds: 15,
                permission_beat_interval_seconds: 30,
                fence_grace_period_seconds: 300,
            },
            worker: WorkerConfig {
                poll_interval_ms: 500,
                continue_on_connector_failure: true,
                index_batch_size: 16,
            },
            connectors: ConnectorsConfig {
                attachment_size_limit_bytes: 10 * 1024 * 1024,
                salesforce_max_parallelism: 4,
                freshdesk_retry_interval_seconds: 5,
                web_max_pages: 1000,
            },
        }
    }
}
