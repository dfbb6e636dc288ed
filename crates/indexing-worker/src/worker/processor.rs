use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use search_shared::kv::{KvStore, Lease};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::connectors::registry::{ConnectorDeps, ConnectorRunner};
use crate::connectors::{
    Checkpoint, ConnectorError, ConnectorFailure, IndexingHeartbeat, SourceConnector,
};
use crate::coordination::{CoordinationRepository, FenceManager};
use crate::indexing::IndexingPipeline;
use crate::scheduler::{IndexingTask, NUM_REPEAT_ERRORS_BEFORE_REPEATED_ERROR_STATE};
use crate::utils::error::WorkerError;

use super::heartbeat::KvHeartbeat;

const ATTEMPT_LEASE_TTL: Duration = Duration::from_secs(120);
/// Overlap window subtracted from the poll start so slow upstream clocks do
/// not cause missed updates.
const POLL_OVERLAP_SECS: i64 = 600;

fn checkpoint_key(pair_id: i32, search_settings_id: i32) -> String {
    format!("indexing_checkpoint_{pair_id}/{search_settings_id}")
}

/// Runs one index attempt end to end: connector batches through the
/// pipeline, with coordination bookkeeping around it.
pub struct AttemptProcessor {
    repository: Arc<CoordinationRepository>,
    kv: Arc<dyn KvStore>,
    fences: Arc<FenceManager>,
    pipeline: Arc<IndexingPipeline>,
    deps: Arc<ConnectorDeps>,
    settings: Settings,
}

impl AttemptProcessor {
    pub fn new(
        repository: Arc<CoordinationRepository>,
        kv: Arc<dyn KvStore>,
        fences: Arc<FenceManager>,
        pipeline: Arc<IndexingPipeline>,
        deps: Arc<ConnectorDeps>,
        settings: Settings,
    ) -> Self {
        Self {
            repository,
            kv,
            fences,
            pipeline,
            deps,
            settings,
        }
    }

    pub async fn process(&self, task: &IndexingTask) -> Result<(), WorkerError> {
        let attempt = self.repository.get_attempt(task.index_attempt_id).await?;
        if attempt.status.is_terminal() {
            warn!("Attempt {} already terminal, skipping", attempt.id);
            return Ok(());
        }
        let pair = self.repository.get_pair(task.pair_id).await?;

        // The attempt lease: losing it mid-run aborts rather than risking
        // double processing
        let lease_key = format!("indexing_lease_{}/{}", pair.id, task.search_settings_id);
        let Some(lease) = Lease::acquire(self.kv.clone(), &lease_key, ATTEMPT_LEASE_TTL)
            .await
            .map_err(|e| WorkerError::Coordination(e.to_string()))?
        else {
            return Err(WorkerError::LeaseLost(lease_key));
        };

        self.repository.mark_started(attempt.id).await?;

        let heartbeat = Arc::new(KvHeartbeat::new(
            self.kv.clone(),
            self.fences.clone(),
            pair.id,
            task.search_settings_id,
            lease,
        ));

        let outcome = self.run_attempt(task, &pair, attempt.from_beginning, heartbeat.clone()).await;

        match outcome {
            Ok((docs, chunks)) => {
                self.repository.mark_succeeded(attempt.id, docs, chunks).await?;
                self.repository.reset_repeated_errors(pair.id).await?;
                self.kv
                    .delete(&checkpoint_key(pair.id, task.search_settings_id))
                    .await
                    .ok();
                info!(
                    "Attempt {} succeeded: {} docs, {} chunks",
                    attempt.id, docs, chunks
                );
            }
            Err(WorkerError::Cancelled) => {
                let reason = if heartbeat.lease_lost() {
                    "attempt lease lost; aborted to avoid double processing"
                } else {
                    "cancelled by stop signal"
                };
                self.repository.mark_canceled(attempt.id, reason).await?;
                info!("Attempt {} cancelled: {}", attempt.id, reason);
            }
            Err(e) => {
                error!("Attempt {} failed: {}", attempt.id, e);
                self.repository
                    .mark_failed(attempt.id, &e.to_string())
                    .await?;
                self.repository
                    .record_attempt_failure(pair.id, NUM_REPEAT_ERRORS_BEFORE_REPEATED_ERROR_STATE)
                    .await?;
            }
        }

        if let Err(e) = self
            .fences
            .clear_fence(pair.id, task.search_settings_id)
            .await
        {
            warn!("Fence clear failed for attempt {}: {}", attempt.id, e);
        }
        Ok(())
    }

    async fn run_attempt(
        &self,
        task: &IndexingTask,
        pair: &crate::coordination::ConnectorCredentialPair,
        from_beginning: bool,
        heartbeat: Arc<KvHeartbeat>,
    ) -> Result<(i32, i32), WorkerError> {
        let connector = SourceConnector::instantiate(
            pair.source,
            &pair.connector_config.0,
            &pair.credentials.0,
            &self.deps,
        )
        .map_err(|e| WorkerError::Connector(e.to_string()))?;

        let window_start = self.poll_window_start(pair.id, task.search_settings_id).await?;
        let window_end = Utc::now();

        let heartbeat_dyn: Arc<dyn IndexingHeartbeat> = heartbeat.clone();
        let runner = connector.runner(window_start, window_end, heartbeat_dyn.clone(), from_beginning);

        let document_sets = BTreeSet::new();
        let mut total_docs = 0i32;
        let mut total_chunks = 0i32;
        let mut failures: Vec<ConnectorFailure> = Vec::new();

        match runner {
            ConnectorRunner::Stream(mut stream) => {
                while let Some(batch) = stream.next().await {
                    let documents = match batch {
                        Ok(documents) => documents,
                        Err(ConnectorError::Cancelled) => return Err(WorkerError::Cancelled),
                        Err(e) => {
                            let failure = ConnectorFailure {
                                document_id: None,
                                link: None,
                                message: e.to_string(),
                            };
                            if self.settings.worker.continue_on_connector_failure {
                                warn!("Batch failed, continuing: {}", failure.message);
                                failures.push(failure);
                                continue;
                            }
                            return Err(WorkerError::Connector(failure.message));
                        }
                    };
                    self.index_documents(
                        &documents,
                        &document_sets,
                        &mut total_docs,
                        &mut total_chunks,
                        &mut failures,
                        task,
                    )
                    .await?;
                }
            }
            ConnectorRunner::Checkpointed(connector) => {
                let ckpt_key = checkpoint_key(pair.id, task.search_settings_id);
                let mut checkpoint = if from_beginning {
                    Checkpoint::initial()
                } else {
                    match self.kv.get(&ckpt_key).await {
                        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|_| {
                            warn!("Unreadable checkpoint for {}, restarting", ckpt_key);
                            Checkpoint::initial()
                        }),
                        _ => Checkpoint::initial(),
                    }
                };

                loop {
                    let batch = connector
                        .next_batch(window_start, window_end, checkpoint, heartbeat_dyn.clone())
                        .await;
                    let batch = match batch {
                        Ok(batch) => batch,
                        Err(ConnectorError::Cancelled) => return Err(WorkerError::Cancelled),
                        Err(e) => return Err(WorkerError::Connector(e.to_string())),
                    };

                    self.index_documents(
                        &batch.documents,
                        &document_sets,
                        &mut total_docs,
                        &mut total_chunks,
                        &mut failures,
                        task,
                    )
                    .await?;

                    match batch.next_checkpoint {
                        Some(next) => {
                            // Persisted after the batch is durably indexed, so
                            // a crash replays at most one batch
                            self.kv
                                .set(&ckpt_key, &serde_json::to_string(&next).unwrap_or_default(), None)
                                .await
                                .map_err(|e| WorkerError::Coordination(e.to_string()))?;
                            checkpoint = next;
                        }
                        None => break,
                    }
                }
            }
        }

        if !failures.is_empty() {
            warn!(
                "Attempt for pair {} completed with {} document failures",
                pair.id,
                failures.len()
            );
        }
        Ok((total_docs, total_chunks))
    }

    async fn index_documents(
        &self,
        documents: &[search_shared::models::Document],
        document_sets: &BTreeSet<String>,
        total_docs: &mut i32,
        total_chunks: &mut i32,
        failures: &mut Vec<ConnectorFailure>,
        task: &IndexingTask,
    ) -> Result<(), WorkerError> {
        if documents.is_empty() {
            return Ok(());
        }
        match self.pipeline.index_batch(documents, document_sets).await {
            Ok((docs, chunks)) => {
                *total_docs += docs as i32;
                *total_chunks += chunks as i32;
                self.repository
                    .update_progress(task.index_attempt_id, *total_docs, *total_chunks)
                    .await?;
                Ok(())
            }
            Err(e) => {
                let failure = ConnectorFailure {
                    document_id: documents.first().map(|d| d.id.clone()),
                    link: None,
                    message: format!("indexing batch failed: {e}"),
                };
                if self.settings.worker.continue_on_connector_failure {
                    warn!("{}", failure.message);
                    failures.push(failure);
                    Ok(())
                } else {
                    Err(WorkerError::Connector(failure.message))
                }
            }
        }
    }

    /// Poll window starts where the last success left off, with overlap.
    async fn poll_window_start(
        &self,
        pair_id: i32,
        search_settings_id: i32,
    ) -> Result<DateTime<Utc>, WorkerError> {
        let last = self
            .repository
            .last_successful_attempt_for(pair_id, search_settings_id)
            .await?;
        Ok(match last {
            Some(attempt) => attempt.time_created - chrono::Duration::seconds(POLL_OVERLAP_SECS),
            None => DateTime::<Utc>::UNIX_EPOCH,
        })
    }
}
