use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use search_shared::models::{DocExternalAccess, ExternalAccess};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::connectors::google_drive::DRIVE_FOLDER_GROUP_PREFIX;
use crate::connectors::registry::ConnectorDeps;
use crate::connectors::{
    ConnectorError, IndexingHeartbeat, NoopHeartbeat, SlimBatchStream, SourceConnector,
};
use crate::coordination::CoordinationRepository;
use crate::utils::error::WorkerError;

use super::store::PermissionStore;
use super::sync_params::sync_config_for;

/// Seam over the durable access store so the runner is testable without a
/// database.
#[async_trait]
pub trait AccessSink: Send + Sync {
    async fn write(&self, record: DocExternalAccess) -> Result<()>;
}

#[async_trait]
impl AccessSink for PermissionStore {
    async fn write(&self, record: DocExternalAccess) -> Result<()> {
        Ok(self.upsert(&record).await?)
    }
}

pub struct DocSyncRunner;

impl DocSyncRunner {
    /// Drain a slim stream into DocExternalAccess records. Slim documents
    /// without permission metadata are recorded as private. A stop signal
    /// surfaces as an error so the sync run fails rather than silently
    /// committing a partial picture as complete.
    pub async fn run(
        mut stream: SlimBatchStream,
        sink: &dyn AccessSink,
    ) -> Result<usize, WorkerError> {
        let mut written = 0usize;

        while let Some(batch) = stream.next().await {
            let batch = batch.map_err(|e| match e {
                ConnectorError::Cancelled => {
                    WorkerError::Connector("permission sync aborted by stop signal".to_string())
                }
                other => WorkerError::Connector(other.to_string()),
            })?;

            for slim in batch {
                let record = DocExternalAccess {
                    doc_id: slim.id,
                    external_access: slim.external_access.unwrap_or_else(ExternalAccess::default),
                };
                sink.write(record)
                    .await
                    .map_err(|e| WorkerError::Connector(e.to_string()))?;
                written += 1;
            }
        }

        debug!("Doc sync wrote {} access records", written);
        Ok(written)
    }
}

/// Beat loop for permission sync: per pair, run doc sync on its cadence;
/// group sync resolves synthetic groups afterwards.
pub struct PermissionSyncScheduler {
    repository: Arc<CoordinationRepository>,
    store: Arc<PermissionStore>,
    deps: Arc<ConnectorDeps>,
    beat_interval: Duration,
}

impl PermissionSyncScheduler {
    pub fn new(
        repository: Arc<CoordinationRepository>,
        store: Arc<PermissionStore>,
        deps: Arc<ConnectorDeps>,
        settings: &Settings,
    ) -> Self {
        Self {
            repository,
            store,
            deps,
            beat_interval: Duration::from_secs(settings.scheduler.permission_beat_interval_seconds),
        }
    }

    pub async fn run(self) {
        info!("Permission sync scheduler started");
        let mut interval = tokio::time::interval(self.beat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!("Permission sync tick failed: {}", e);
            }
        }
    }

    pub async fn tick(&self) -> Result<(), WorkerError> {
        let pairs = self.repository.pairs_for_scheduling().await?;
        let now = Utc::now();

        for pair in &pairs {
            let Some(config) = sync_config_for(pair.source) else {
                continue;
            };
            let Some(doc_sync) = config.doc_sync else {
                continue;
            };

            let due = match pair.last_time_perm_sync {
                None => doc_sync.initial_index_should_sync,
                Some(last) => {
                    now.signed_duration_since(last).num_seconds() >= doc_sync.frequency_secs
                }
            };
            if !due {
                continue;
            }

            info!("Running permission doc sync for pair {}", pair.id);
            let heartbeat: Arc<dyn IndexingHeartbeat> = Arc::new(NoopHeartbeat);

            let connector = match SourceConnector::instantiate(
                pair.source,
                &pair.connector_config.0,
                &pair.credentials.0,
                &self.deps,
            ) {
                Ok(connector) => connector,
                Err(e) => {
                    warn!("Cannot build connector for pair {}: {}", pair.id, e);
                    continue;
                }
            };

            let Some(slim_stream) = connector.slim_runner(None, None, heartbeat) else {
                debug!("Source {} has no slim path, skipping", pair.source);
                continue;
            };

            match DocSyncRunner::run(slim_stream, self.store.as_ref()).await {
                Ok(written) => {
                    info!("Pair {} doc sync wrote {} records", pair.id, written);
                    self.repository.set_last_perm_sync(pair.id, now).await?;
                }
                Err(e) => {
                    warn!("Doc sync failed for pair {}: {}", pair.id, e);
                }
            }

            if config.group_sync.is_some() {
                if let Err(e) = self.sync_drive_folder_groups(pair).await {
                    warn!("Group sync failed for pair {}: {}", pair.id, e);
                }
            }
        }
        Ok(())
    }

    /// Resolve the synthetic drive_folder groups referenced by stored ACLs
    /// into concrete member lists.
    async fn sync_drive_folder_groups(
        &self,
        pair: &crate::coordination::ConnectorCredentialPair,
    ) -> Result<(), WorkerError> {
        if pair.source != search_shared::models::DocumentSource::GoogleDrive {
            return Ok(());
        }

        let connector = SourceConnector::instantiate(
            pair.source,
            &pair.connector_config.0,
            &pair.credentials.0,
            &self.deps,
        )
        .map_err(|e| WorkerError::Connector(e.to_string()))?;
        let SourceConnector::GoogleDrive(drive) = connector else {
            return Ok(());
        };

        for group_id in self
            .store
            .group_ids_with_prefix(DRIVE_FOLDER_GROUP_PREFIX)
            .await?
        {
            let folder_id = group_id
                .strip_prefix(DRIVE_FOLDER_GROUP_PREFIX)
                .unwrap_or(&group_id);
            match drive.folder_member_emails(folder_id).await {
                Ok(members) => {
                    self.store.upsert_group(&group_id, &members).await?;
                }
                Err(e) => warn!("Could not resolve folder group {}: {}", group_id, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_stream::try_stream;
    use search_shared::models::SlimDocument;
    use std::collections::BTreeSet;
    use tokio::sync::Mutex;

    struct MemorySink {
        records: Mutex<Vec<DocExternalAccess>>,
    }

    #[async_trait]
    impl AccessSink for MemorySink {
        async fn write(&self, record: DocExternalAccess) -> Result<()> {
            self.records.lock().await.push(record);
            Ok(())
        }
    }

    fn slim(id: &str, public: bool) -> SlimDocument {
        SlimDocument {
            id: id.to_string(),
            external_access: Some(ExternalAccess {
                external_user_emails: BTreeSet::from(["a@ex.com".to_string()]),
                external_user_group_ids: BTreeSet::new(),
                is_public: public,
            }),
        }
    }

    #[tokio::test]
    async fn test_doc_sync_writes_every_record() {
        let stream: SlimBatchStream = Box::pin(try_stream! {
            yield vec![slim("doc-1", false), slim("doc-2", true)];
            yield vec![slim("doc-3", false)];
        });
        let sink = MemorySink {
            records: Mutex::new(Vec::new()),
        };

        let written = DocSyncRunner::run(stream, &sink).await.unwrap();
        assert_eq!(written, 3);
        let records = sink.records.lock().await;
        assert_eq!(records[1].doc_id, "doc-2");
        assert!(records[1].external_access.is_public);
    }

    #[tokio::test]
    async fn test_doc_sync_is_idempotent_for_same_input() {
        let make_stream = || -> SlimBatchStream {
            Box::pin(try_stream! {
                yield vec![slim("doc-1", false), slim("doc-2", true)];
            })
        };

        let sink_a = MemorySink { records: Mutex::new(Vec::new()) };
        let sink_b = MemorySink { records: Mutex::new(Vec::new()) };
        DocSyncRunner::run(make_stream(), &sink_a).await.unwrap();
        DocSyncRunner::run(make_stream(), &sink_b).await.unwrap();

        assert_eq!(*sink_a.records.lock().await, *sink_b.records.lock().await);
    }

    #[tokio::test]
    async fn test_stop_signal_aborts_with_error() {
        let stream: SlimBatchStream = Box::pin(try_stream! {
            yield vec![slim("doc-1", false)];
            Err(ConnectorError::Cancelled)?;
        });
        let sink = MemorySink {
            records: Mutex::new(Vec::new()),
        };

        let result = DocSyncRunner::run(stream, &sink).await;
        assert!(result.is_err());
        // The batch before the stop was still written
        assert_eq!(sink.records.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_access_defaults_to_private() {
        let stream: SlimBatchStream = Box::pin(try_stream! {
            yield vec![SlimDocument { id: "doc-x".to_string(), external_access: None }];
        });
        let sink = MemorySink {
            records: Mutex::new(Vec::new()),
        };

        DocSyncRunner::run(stream, &sink).await.unwrap();
        let records = sink.records.lock().await;
        assert!(!records[0].external_access.is_public);
        assert!(records[0].external_access.external_user_emails.is_empty());
    }
}
