use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use search_shared::http::HttpPoolError;
use search_shared::models::{Document, DocumentSource, SlimDocument};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Indexing cancelled by stop signal")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] HttpPoolError),

    #[error("Bad payload from source: {0}")]
    BadPayload(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Per-document failure recorded while an attempt keeps going.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorFailure {
    pub document_id: Option<String>,
    pub link: Option<String>,
    pub message: String,
}

/// Callback every connector must drive at least once per batch. Stop checks
/// make cancellation cooperative; progress renews the attempt lease and
/// bumps counters.
#[async_trait]
pub trait IndexingHeartbeat: Send + Sync {
    async fn should_stop(&self) -> bool;
    async fn progress(&self, tag: &str, amount: i64);
}

/// Heartbeat that never stops, for tests and one-shot CLI runs.
pub struct NoopHeartbeat;

#[async_trait]
impl IndexingHeartbeat for NoopHeartbeat {
    async fn should_stop(&self) -> bool {
        false
    }

    async fn progress(&self, _tag: &str, _amount: i64) {}
}

/// Opaque resume token handed back by checkpointed connectors with each
/// batch so a crashed attempt restarts where it left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint(pub serde_json::Value);

impl Checkpoint {
    pub fn initial() -> Self {
        Checkpoint(serde_json::Value::Null)
    }
}

/// One pull from a checkpointed connector.
#[derive(Debug)]
pub struct CheckpointBatch {
    pub documents: Vec<Document>,
    /// None means the sequence is exhausted.
    pub next_checkpoint: Option<Checkpoint>,
}

pub type BatchStream =
    Pin<Box<dyn Stream<Item = ConnectorResult<Vec<Document>>> + Send + 'static>>;

pub type SlimBatchStream =
    Pin<Box<dyn Stream<Item = ConnectorResult<Vec<SlimDocument>>> + Send + 'static>>;

/// Restartable finite sequence from a fixed starting state.
#[async_trait]
pub trait LoadConnector: Send + Sync {
    fn source(&self) -> DocumentSource;

    fn load(&self, heartbeat: Arc<dyn IndexingHeartbeat>) -> BatchStream;
}

/// Finite sequence of documents whose updated-time falls in [start, end].
#[async_trait]
pub trait PollConnector: Send + Sync {
    fn source(&self) -> DocumentSource;

    fn poll(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> BatchStream;
}

/// Pull-based resumable sequence; the caller persists the checkpoint
/// between pulls.
#[async_trait]
pub trait CheckpointedConnector: Send + Sync {
    fn source(&self) -> DocumentSource;

    async fn next_batch(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        checkpoint: Checkpoint,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> ConnectorResult<CheckpointBatch>;
}

/// Ids + permission metadata only, for ACL sync.
#[async_trait]
pub trait SlimConnector: Send + Sync {
    fn source(&self) -> DocumentSource;

    fn slim_documents(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> SlimBatchStream;
}

/// Shared per-batch bookkeeping: bail on stop, report progress.
pub async fn heartbeat_batch(
    heartbeat: &Arc<dyn IndexingHeartbeat>,
    tag: &str,
    amount: i64,
) -> ConnectorResult<()> {
    if heartbeat.should_stop().await {
        return Err(ConnectorError::Cancelled);
    }
    heartbeat.progress(tag, amount).await;
    Ok(())
}
