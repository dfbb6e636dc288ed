pub mod heartbeat;
pub mod processor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use search_shared::kv::KvStore;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::scheduler::{queues, IndexingTask};

pub use heartbeat::KvHeartbeat;
pub use processor::AttemptProcessor;

/// Consumes indexing tasks from the distributed queue. User-file tasks are
/// drained first; they are small and latency-sensitive.
pub struct IndexingWorker {
    kv: Arc<dyn KvStore>,
    processor: Arc<AttemptProcessor>,
    poll_interval: Duration,
}

impl IndexingWorker {
    pub fn new(kv: Arc<dyn KvStore>, processor: Arc<AttemptProcessor>, settings: &Settings) -> Self {
        Self {
            kv,
            processor,
            poll_interval: Duration::from_millis(settings.worker.poll_interval_ms),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Indexing worker started");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                task = self.next_task() => {
                    match task {
                        Ok(Some(task)) => {
                            info!(
                                "Processing task {} (attempt {})",
                                task.task_id, task.index_attempt_id
                            );
                            match self.processor.process(&task).await {
                                Ok(_) => info!("Attempt {} finished", task.index_attempt_id),
                                Err(e) => {
                                    error!("Attempt {} failed: {}", task.index_attempt_id, e)
                                }
                            }
                        }
                        Ok(None) => {
                            tokio::time::sleep(self.poll_interval).await;
                        }
                        Err(e) => {
                            warn!("Queue poll failed: {}", e);
                            tokio::time::sleep(self.poll_interval).await;
                        }
                    }
                }
            }
        }

        info!("Indexing worker stopped");
        Ok(())
    }

    async fn next_task(&self) -> Result<Option<IndexingTask>> {
        for queue in [queues::USER_FILES_INDEXING, queues::CONNECTOR_DOC_FETCHING] {
            if let Some(raw) = self.kv.queue_pop(queue).await? {
                match serde_json::from_str::<IndexingTask>(&raw) {
                    Ok(task) => return Ok(Some(task)),
                    Err(e) => {
                        warn!("Dropping unparseable task from {}: {}", queue, e);
                    }
                }
            }
        }
        Ok(None)
    }
}
