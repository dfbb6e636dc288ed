use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use search_shared::models::{Document, DocumentSource, Section};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::extract::ContentExtractor;

use super::interfaces::{
    heartbeat_batch, CheckpointBatch, Checkpoint, ConnectorError, ConnectorResult,
    IndexingHeartbeat, CheckpointedConnector,
};

const FILE_ID_PREFIX: &str = "FILE_CONNECTOR__";
const FILES_PER_BATCH: usize = 16;

#[derive(Debug, Serialize, Deserialize, Default)]
struct FileCheckpoint {
    next_index: usize,
}

/// Ingests files previously saved to the platform file store. Checkpoints
/// carry the position in the sorted listing so a crashed attempt resumes
/// instead of rereading everything.
#[derive(Clone)]
pub struct FileConnector {
    store_root: PathBuf,
    stored_ids: Vec<String>,
    extractor: Arc<ContentExtractor>,
}

impl FileConnector {
    pub fn from_config(
        config: &serde_json::Value,
        store_root: PathBuf,
        extractor: Arc<ContentExtractor>,
    ) -> ConnectorResult<Self> {
        let mut stored_ids: Vec<String> = config
            .get("file_ids")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .ok_or_else(|| ConnectorError::BadPayload("file connector needs file_ids".into()))?;
        stored_ids.sort();
        Ok(Self {
            store_root,
            stored_ids,
            extractor,
        })
    }

    async fn document_from_stored_file(&self, stored_id: &str) -> Option<Document> {
        let path = self.store_root.join(stored_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Stored file {} unreadable: {}", stored_id, e);
                return None;
            }
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| stored_id.to_string());

        let extracted = self.extractor.extract(&bytes, Some(&file_name), None).await;
        if extracted.text.trim().is_empty() {
            warn!("Stored file {} produced no text", stored_id);
            return None;
        }

        let doc_updated_at: Option<DateTime<Utc>> = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        Some(Document {
            id: format!("{FILE_ID_PREFIX}{stored_id}"),
            sections: vec![Section::text(None, extracted.text)],
            source: DocumentSource::File,
            semantic_identifier: file_name,
            doc_updated_at,
            primary_owners: None,
            metadata: HashMap::new(),
            external_access: None,
        })
    }
}

#[async_trait]
impl CheckpointedConnector for FileConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::File
    }

    async fn next_batch(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        checkpoint: Checkpoint,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> ConnectorResult<CheckpointBatch> {
        let state: FileCheckpoint = if checkpoint.0.is_null() {
            FileCheckpoint::default()
        } else {
            serde_json::from_value(checkpoint.0)
                .map_err(|e| ConnectorError::BadPayload(format!("bad file checkpoint: {e}")))?
        };

        let slice_end = (state.next_index + FILES_PER_BATCH).min(self.stored_ids.len());
        let ids = &self.stored_ids[state.next_index..slice_end];

        heartbeat_batch(&heartbeat, "file_batch", ids.len() as i64).await?;

        let mut documents = Vec::new();
        for stored_id in ids {
            if let Some(doc) = self.document_from_stored_file(stored_id).await {
                documents.push(doc);
            }
        }

        let next_checkpoint = if slice_end >= self.stored_ids.len() {
            None
        } else {
            let state = serde_json::to_value(FileCheckpoint {
                next_index: slice_end,
            })
            .map_err(|e| ConnectorError::BadPayload(format!("checkpoint encode: {e}")))?;
            Some(Checkpoint(state))
        };

        Ok(CheckpointBatch {
            documents,
            next_checkpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::interfaces::NoopHeartbeat;
    use std::io::Write;

    fn write_store(dir: &tempfile::TempDir, files: &[(&str, &str)]) -> Vec<String> {
        let mut ids = Vec::new();
        for (name, content) in files {
            let path = dir.path().join(name);
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(content.as_bytes()).unwrap();
            ids.push(name.to_string());
        }
        ids
    }

    #[tokio::test]
    async fn test_checkpoint_resume_covers_all_files_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..40).map(|i| format!("doc_{i:02}.txt")).collect();
        let files: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "body")).collect();
        write_store(&dir, &files);

        let config = serde_json::json!({ "file_ids": names });
        let connector = FileConnector::from_config(
            &config,
            dir.path().to_path_buf(),
            Arc::new(ContentExtractor::new(None, false)),
        )
        .unwrap();

        let heartbeat: Arc<dyn IndexingHeartbeat> = Arc::new(NoopHeartbeat);
        let mut checkpoint = Checkpoint::initial();
        let mut seen = Vec::new();
        loop {
            let batch = connector
                .next_batch(Utc::now(), Utc::now(), checkpoint, heartbeat.clone())
                .await
                .unwrap();
            seen.extend(batch.documents.iter().map(|d| d.id.clone()));
            match batch.next_checkpoint {
                Some(next) => checkpoint = next,
                None => break,
            }
        }

        assert_eq!(seen.len(), 40);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 40);
        assert!(seen[0].starts_with("FILE_CONNECTOR__doc_00"));
    }

    #[tokio::test]
    async fn test_unreadable_file_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_store(&dir, &[("exists.txt", "hello")]);

        let config = serde_json::json!({ "file_ids": ["exists.txt", "missing.txt"] });
        let connector = FileConnector::from_config(
            &config,
            dir.path().to_path_buf(),
            Arc::new(ContentExtractor::new(None, false)),
        )
        .unwrap();

        let heartbeat: Arc<dyn IndexingHeartbeat> = Arc::new(NoopHeartbeat);
        let batch = connector
            .next_batch(Utc::now(), Utc::now(), Checkpoint::initial(), heartbeat)
            .await
            .unwrap();
        assert_eq!(batch.documents.len(), 1);
        assert_eq!(batch.documents[0].id, "FILE_CONNECTOR__exists.txt");
    }
}
