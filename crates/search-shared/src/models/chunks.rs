use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::access::DocumentAccess;
use super::documents::{DocumentSource, MetadataValue};

/// A chunk cut from a document, before embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocAwareChunk {
    pub document_id: String,
    pub chunk_id: i32,
    pub content: String,
    pub source: DocumentSource,
    pub semantic_identifier: String,
    pub link: Option<String>,
    pub metadata: HashMap<String, MetadataValue>,
    pub doc_updated_at: Option<DateTime<Utc>>,
    pub token_count: usize,
    /// Set on synthetic large chunks that stand in for a run of normal
    /// chunks during hierarchical retrieval.
    pub large_chunk_reference_ids: Vec<i32>,
}

/// Chunk plus its dense vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexChunk {
    pub chunk: DocAwareChunk,
    pub embedding: Vec<f32>,
}

/// The final shape written to the index: chunk + access snapshot +
/// document-set memberships + boost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadataAwareIndexChunk {
    pub chunk: IndexChunk,
    pub access: DocumentAccess,
    pub document_sets: BTreeSet<String>,
    pub boost: i32,
}

pub const DEFAULT_BOOST: i32 = 0;

impl DocMetadataAwareIndexChunk {
    pub fn from_index_chunk(
        index_chunk: IndexChunk,
        access: DocumentAccess,
        document_sets: BTreeSet<String>,
        boost: i32,
    ) -> Self {
        Self {
            chunk: index_chunk,
            access,
            document_sets,
            boost,
        }
    }
}

/// A chunk as returned by the index at query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceChunk {
    pub document_id: String,
    pub chunk_id: i32,
    pub content: String,
    pub source: DocumentSource,
    pub semantic_identifier: String,
    pub link: Option<String>,
    pub metadata: HashMap<String, MetadataValue>,
    pub doc_updated_at: Option<DateTime<Utc>>,
    pub large_chunk_reference_ids: Vec<i32>,
    pub score: Option<f32>,
}

impl InferenceChunk {
    pub fn score_or_zero(&self) -> f32 {
        self.score.unwrap_or(0.0)
    }

    /// Image chunks carry a pointer back to the page they were extracted
    /// from, enabling source co-retrieval.
    pub fn source_document_id(&self) -> Option<&str> {
        self.metadata
            .get("source_document_id")
            .and_then(|v| v.as_single())
    }
}
