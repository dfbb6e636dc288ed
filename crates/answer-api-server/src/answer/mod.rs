pub mod chunked;
pub mod citation;
pub mod engine;
pub mod events;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use search_shared::models::{DocumentSource, InferenceChunk, MetadataValue};
use serde::{Deserialize, Serialize};

pub use citation::{map_document_id_order, CitationProcessor};
pub use engine::{AnswerEngine, AnswerRequest, ForceUseTool};
pub use events::{AnswerEvent, CitationInfo, StreamStopReason};

/// A retrieved document as the LLM sees it: one entry per document, ordered
/// by the rank used in citation prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDoc {
    pub document_id: String,
    pub semantic_identifier: String,
    pub link: Option<String>,
    pub source: DocumentSource,
    pub content: String,
    pub blurb: String,
    pub metadata: HashMap<String, MetadataValue>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LlmDoc {
    pub fn from_chunk(chunk: &InferenceChunk) -> Self {
        let blurb: String = chunk.content.chars().take(200).collect();
        Self {
            document_id: chunk.document_id.clone(),
            semantic_identifier: chunk.semantic_identifier.clone(),
            link: chunk.link.clone(),
            source: chunk.source,
            content: chunk.content.clone(),
            blurb,
            metadata: chunk.metadata.clone(),
            updated_at: chunk.doc_updated_at,
        }
    }
}

/// Collapse chunks into one LlmDoc per document, preserving first-seen
/// (score) order and concatenating chunk contents.
pub fn llm_docs_from_chunks(chunks: &[InferenceChunk]) -> Vec<LlmDoc> {
    let mut docs: Vec<LlmDoc> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for chunk in chunks {
        match index_by_id.get(&chunk.document_id) {
            Some(&idx) => {
                let doc = &mut docs[idx];
                doc.content.push_str("\n");
                doc.content.push_str(&chunk.content);
            }
            None => {
                index_by_id.insert(chunk.document_id.clone(), docs.len());
                docs.push(LlmDoc::from_chunk(chunk));
            }
        }
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc_id: &str, chunk_id: i32, content: &str) -> InferenceChunk {
        InferenceChunk {
            document_id: doc_id.to_string(),
            chunk_id,
            content: content.to_string(),
            source: DocumentSource::Web,
            semantic_identifier: doc_id.to_string(),
            link: None,
            metadata: HashMap::new(),
            doc_updated_at: None,
            large_chunk_reference_ids: Vec::new(),
            score: None,
        }
    }

    #[test]
    fn test_llm_docs_collapse_by_document() {
        let chunks = vec![
            chunk("A", 0, "first"),
            chunk("B", 0, "other"),
            chunk("A", 1, "second"),
        ];
        let docs = llm_docs_from_chunks(&chunks);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].document_id, "A");
        assert_eq!(docs[0].content, "first\nsecond");
        assert_eq!(docs[1].document_id, "B");
    }
}
