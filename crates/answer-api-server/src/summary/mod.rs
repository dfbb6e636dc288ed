use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use search_shared::index::{ChunkRequest, DocumentIndex, IndexBatchParams, IndexFilters};
use search_shared::llm::{LlmClient, LlmMessage};
use search_shared::models::{
    DocAwareChunk, DocMetadataAwareIndexChunk, DocumentAccess, DocumentSource, IndexChunk,
    MetadataValue, DEFAULT_BOOST,
};
use search_shared::text::count_tokens;
use tracing::{info, warn};
use uuid::Uuid;

use crate::retrieval::QueryEmbedder;

/// Messages included verbatim after the summary at answer time.
const CONTEXT_TAIL_MESSAGES: usize = 3;

#[derive(Debug, Clone)]
pub struct ChatSummary {
    pub session_id: Uuid,
    pub summary: String,
    pub message_count_at_creation: usize,
    pub summary_version: i32,
    pub created_at: DateTime<Utc>,
}

pub fn summary_doc_id(session_id: Uuid) -> String {
    format!("chat_summary_{session_id}")
}

/// Incremental conversation summaries stored as index documents. The doc id
/// is stable per session, so a version bump overwrites in place and the
/// record with the greatest summary_version is canonical.
pub struct ChatSummarizer {
    index: Arc<dyn DocumentIndex>,
    embedder: Arc<dyn QueryEmbedder>,
    llm: Arc<dyn LlmClient>,
    threshold: usize,
}

impl ChatSummarizer {
    pub fn new(
        index: Arc<dyn DocumentIndex>,
        embedder: Arc<dyn QueryEmbedder>,
        llm: Arc<dyn LlmClient>,
        threshold: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            llm,
            threshold,
        }
    }

    /// Summarize when enough messages have accumulated since the last
    /// summary (or since the start). A zero threshold disables the cache.
    pub fn should_summarize(&self, total_messages: usize, last: Option<&ChatSummary>) -> bool {
        if self.threshold == 0 {
            return false;
        }
        match last {
            None => total_messages >= self.threshold,
            Some(last) => total_messages - last.message_count_at_creation.min(total_messages)
                >= self.threshold,
        }
    }

    pub async fn latest_summary(&self, session_id: Uuid) -> Option<ChatSummary> {
        let chunks = self
            .index
            .id_based_retrieval(
                vec![ChunkRequest {
                    document_id: summary_doc_id(session_id),
                    min_chunk_ind: None,
                    max_chunk_ind: None,
                }],
                IndexFilters::default(),
                false,
            )
            .await
            .ok()?;

        chunks
            .iter()
            .filter_map(|chunk| {
                let version = chunk
                    .metadata
                    .get("summary_version")?
                    .as_single()?
                    .parse::<i32>()
                    .ok()?;
                let message_count = chunk
                    .metadata
                    .get("message_count_at_creation")
                    .and_then(|v| v.as_single())
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(0);
                Some(ChatSummary {
                    session_id,
                    summary: chunk.content.clone(),
                    message_count_at_creation: message_count,
                    summary_version: version,
                    created_at: chunk.doc_updated_at.unwrap_or_else(Utc::now),
                })
            })
            .max_by_key(|s| s.summary_version)
    }

    /// Create or bump the session summary. Only messages newer than the
    /// prior summary are fed to the model alongside that summary.
    pub async fn create_or_update(
        &self,
        session_id: Uuid,
        user_email: Option<&str>,
        messages: &[LlmMessage],
    ) -> Result<Option<String>> {
        if self.threshold == 0 {
            return Ok(None);
        }

        let last = self.latest_summary(session_id).await;
        if !self.should_summarize(messages.len(), last.as_ref()) {
            return Ok(last.map(|s| s.summary));
        }

        let (to_summarize, existing, version) = match &last {
            None => (messages, None, 1),
            Some(last) => (
                &messages[last.message_count_at_creation.min(messages.len())..],
                Some(last.summary.as_str()),
                last.summary_version + 1,
            ),
        };

        info!(
            "{} summary for session {} ({} new messages, v{})",
            if existing.is_some() { "Updating" } else { "Creating" },
            session_id,
            to_summarize.len(),
            version
        );

        let summary_text = self.generate(to_summarize, existing).await?;
        let summary = ChatSummary {
            session_id,
            summary: summary_text.clone(),
            message_count_at_creation: messages.len(),
            summary_version: version,
            created_at: Utc::now(),
        };
        self.store(&summary, user_email).await?;

        Ok(Some(summary_text))
    }

    async fn generate(
        &self,
        messages: &[LlmMessage],
        existing_summary: Option<&str>,
    ) -> Result<String> {
        let formatted: String = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    search_shared::llm::LlmRole::User => "user",
                    _ => "assistant",
                };
                format!("{role}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = match existing_summary {
            Some(existing) => vec![
                LlmMessage::system(
                    "You are a helpful assistant that updates conversation summaries. \
                     Incorporate the new messages while keeping key points from the \
                     previous summary.",
                ),
                LlmMessage::user(format!(
                    "Update the following conversation summary with the new messages.\n\n\
                     Existing Summary:\n{existing}\n\nNew Messages:\n{formatted}\n\nUpdated Summary:"
                )),
            ],
            None => vec![
                LlmMessage::system(
                    "You are a helpful assistant that summarizes conversations. Provide \
                     concise summaries focusing on main points; keep user messages mostly \
                     as they are.",
                ),
                LlmMessage::user(format!(
                    "Summarize the following conversation:\n\n{formatted}\n\nSummary:"
                )),
            ],
        };

        let summary = self.llm.complete(&prompt, None, None, None).await?;
        Ok(summary.trim().to_string())
    }

    /// Write the summary as a single-chunk index document. Upsert semantics
    /// on the stable doc id make this idempotent.
    async fn store(&self, summary: &ChatSummary, user_email: Option<&str>) -> Result<()> {
        let doc_id = summary_doc_id(summary.session_id);

        let embedding = match self.embedder.embed_query(&summary.summary).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("Could not embed summary, storing without vector: {}", e);
                Vec::new()
            }
        };

        let mut metadata: HashMap<String, MetadataValue> = HashMap::new();
        metadata.insert("document_type".to_string(), "chat_summary".into());
        metadata.insert(
            "chat_session_id".to_string(),
            summary.session_id.to_string().into(),
        );
        metadata.insert(
            "summary_version".to_string(),
            summary.summary_version.to_string().into(),
        );
        metadata.insert(
            "message_count_at_creation".to_string(),
            summary.message_count_at_creation.to_string().into(),
        );

        let chunk = DocAwareChunk {
            document_id: doc_id.clone(),
            chunk_id: 0,
            content: summary.summary.clone(),
            source: DocumentSource::ChatSummary,
            semantic_identifier: format!(
                "Chat Summary for {} (v{})",
                summary.session_id, summary.summary_version
            ),
            link: None,
            metadata,
            doc_updated_at: Some(summary.created_at),
            token_count: count_tokens(&summary.summary),
            large_chunk_reference_ids: Vec::new(),
        };

        let access = DocumentAccess::build(
            user_email.map(|e| vec![e.to_string()]).unwrap_or_default(),
            vec![],
            vec![],
            vec![],
            false,
        );

        let indexable = vec![DocMetadataAwareIndexChunk::from_index_chunk(
            IndexChunk { chunk, embedding },
            access,
            BTreeSet::new(),
            DEFAULT_BOOST,
        )];

        let params = IndexBatchParams {
            doc_id_to_previous_chunk_cnt: HashMap::from([(doc_id.clone(), None)]),
            doc_id_to_new_chunk_cnt: HashMap::from([(doc_id, 1)]),
            large_chunks_enabled: false,
        };

        self.index.index(indexable, params).await?;
        info!(
            "Stored chat summary v{} for session {}",
            summary.summary_version, summary.session_id
        );
        Ok(())
    }
}

/// Context assembly at answer time: system prompt, then the latest summary
/// (when one exists), then only the last few messages verbatim.
pub fn context_messages(
    summary: Option<&ChatSummary>,
    messages: &[LlmMessage],
) -> (Option<String>, Vec<LlmMessage>) {
    match summary {
        None => (None, messages.to_vec()),
        Some(summary) => {
            let tail_start = messages.len().saturating_sub(CONTEXT_TAIL_MESSAGES);
            (
                Some(summary.summary.clone()),
                messages[tail_start..].to_vec(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_shared::models::InferenceChunk;
    use std::sync::Mutex;

    struct StubIndex {
        stored: Mutex<Vec<InferenceChunk>>,
    }

    #[async_trait]
    impl DocumentIndex for StubIndex {
        async fn hybrid_retrieval(
            &self,
            _request: search_shared::index::HybridSearchRequest,
        ) -> Result<Vec<InferenceChunk>> {
            Ok(Vec::new())
        }

        async fn id_based_retrieval(
            &self,
            requests: Vec<ChunkRequest>,
            _filters: IndexFilters,
            _batch: bool,
        ) -> Result<Vec<InferenceChunk>> {
            let stored = self.stored.lock().unwrap();
            Ok(stored
                .iter()
                .filter(|c| requests.iter().any(|r| r.document_id == c.document_id))
                .cloned()
                .collect())
        }

        async fn index(
            &self,
            chunks: Vec<DocMetadataAwareIndexChunk>,
            _params: IndexBatchParams,
        ) -> Result<()> {
            let mut stored = self.stored.lock().unwrap();
            for c in chunks {
                // Upsert on doc id, like the real engine
                stored.retain(|existing| existing.document_id != c.chunk.chunk.document_id);
                stored.push(InferenceChunk {
                    document_id: c.chunk.chunk.document_id,
                    chunk_id: c.chunk.chunk.chunk_id,
                    content: c.chunk.chunk.content,
                    source: c.chunk.chunk.source,
                    semantic_identifier: c.chunk.chunk.semantic_identifier,
                    link: None,
                    metadata: c.chunk.chunk.metadata,
                    doc_updated_at: c.chunk.chunk.doc_updated_at,
                    large_chunk_reference_ids: Vec::new(),
                    score: None,
                });
            }
            Ok(())
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl QueryEmbedder for StubEmbedder {
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 8])
        }
    }

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        fn config(&self) -> &search_shared::llm::LlmConfig {
            static CONFIG: once_cell::sync::Lazy<search_shared::llm::LlmConfig> =
                once_cell::sync::Lazy::new(|| search_shared::llm::LlmConfig {
                    model_name: "stub".to_string(),
                    max_input_tokens: 8192,
                    supports_tool_calling: false,
                });
            &CONFIG
        }

        async fn complete(
            &self,
            messages: &[LlmMessage],
            _tools: Option<&[search_shared::llm::ToolDefinition]>,
            _choice: Option<search_shared::llm::ToolChoice>,
            _format: Option<serde_json::Value>,
        ) -> Result<String, search_shared::llm::LlmError> {
            // Echo whether this was an update to make assertions easy
            if messages
                .iter()
                .any(|m| m.content.contains("Existing Summary"))
            {
                Ok("updated summary".to_string())
            } else {
                Ok("first summary".to_string())
            }
        }

        async fn stream(
            &self,
            _messages: &[LlmMessage],
            _tools: Option<&[search_shared::llm::ToolDefinition]>,
            _choice: Option<search_shared::llm::ToolChoice>,
            _format: Option<serde_json::Value>,
        ) -> Result<search_shared::llm::LlmStream, search_shared::llm::LlmError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    fn summarizer(threshold: usize) -> ChatSummarizer {
        ChatSummarizer::new(
            Arc::new(StubIndex {
                stored: Mutex::new(Vec::new()),
            }),
            Arc::new(StubEmbedder),
            Arc::new(StubLlm),
            threshold,
        )
    }

    fn messages(n: usize) -> Vec<LlmMessage> {
        (0..n)
            .map(|i| LlmMessage::user(format!("message {i}")))
            .collect()
    }

    #[test]
    fn test_should_summarize_thresholds() {
        let s = summarizer(4);
        assert!(!s.should_summarize(3, None));
        assert!(s.should_summarize(4, None));

        let last = ChatSummary {
            session_id: Uuid::new_v4(),
            summary: "s".to_string(),
            message_count_at_creation: 4,
            summary_version: 1,
            created_at: Utc::now(),
        };
        assert!(!s.should_summarize(6, Some(&last)));
        assert!(s.should_summarize(8, Some(&last)));
    }

    #[test]
    fn test_zero_threshold_disables_summaries() {
        let s = summarizer(0);
        assert!(!s.should_summarize(1000, None));
    }

    #[tokio::test]
    async fn test_version_bumps_and_latest_wins() {
        let s = summarizer(2);
        let session = Uuid::new_v4();

        let first = s
            .create_or_update(session, Some("u@ex.com"), &messages(2))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("first summary"));

        let latest = s.latest_summary(session).await.unwrap();
        assert_eq!(latest.summary_version, 1);
        assert_eq!(latest.message_count_at_creation, 2);

        // Two more messages: update path, version 2
        let second = s
            .create_or_update(session, Some("u@ex.com"), &messages(4))
            .await
            .unwrap();
        assert_eq!(second.as_deref(), Some("updated summary"));

        let latest = s.latest_summary(session).await.unwrap();
        assert_eq!(latest.summary_version, 2);
        assert_eq!(latest.summary, "updated summary");
    }

    #[tokio::test]
    async fn test_below_threshold_returns_existing_summary() {
        let s = summarizer(2);
        let session = Uuid::new_v4();
        s.create_or_update(session, None, &messages(2)).await.unwrap();

        // One more message is below the threshold; the stored summary comes
        // back unchanged
        let result = s.create_or_update(session, None, &messages(3)).await.unwrap();
        assert_eq!(result.as_deref(), Some("first summary"));
        assert_eq!(s.latest_summary(session).await.unwrap().summary_version, 1);
    }

    #[test]
    fn test_context_messages_tail() {
        let all = messages(10);
        let summary = ChatSummary {
            session_id: Uuid::new_v4(),
            summary: "the story so far".to_string(),
            message_count_at_creation: 7,
            summary_version: 3,
            created_at: Utc::now(),
        };

        let (summary_text, tail) = context_messages(Some(&summary), &all);
        assert_eq!(summary_text.as_deref(), Some("the story so far"));
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[2].content, "message 9");

        let (none_summary, full) = context_messages(None, &all);
        assert!(none_summary.is_none());
        assert_eq!(full.len(), 10);
    }
}
