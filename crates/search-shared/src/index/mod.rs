pub mod client;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DocMetadataAwareIndexChunk, DocumentSource, InferenceChunk};

pub use client::HttpDocumentIndex;

/// Filters applied server-side by the index engine. Every retrieval request
/// carries an access-control list; a chunk is returned only if one of its
/// ACL tokens matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFilters {
    pub access_control_list: Option<Vec<String>>,
    pub source_types: Option<Vec<DocumentSource>>,
    pub tags: Option<Vec<(String, String)>>,
    pub document_sets: Option<Vec<String>>,
    pub time_cutoff: Option<DateTime<Utc>>,
    pub connector_name: Option<String>,
}

/// Request for chunks by id, optionally bounded to an ordinal range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub document_id: String,
    pub min_chunk_ind: Option<i32>,
    pub max_chunk_ind: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSearchRequest {
    pub query: String,
    pub query_embedding: Vec<f32>,
    pub final_keywords: Vec<String>,
    pub filters: IndexFilters,
    pub hybrid_alpha: f32,
    pub time_decay_multiplier: f32,
    pub num_to_retrieve: usize,
    pub offset: usize,
}

/// Upsert parameters for a batch write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexBatchParams {
    pub doc_id_to_previous_chunk_cnt: HashMap<String, Option<i32>>,
    pub doc_id_to_new_chunk_cnt: HashMap<String, i32>,
    pub large_chunks_enabled: bool,
}

/// Contract over the out-of-process vector/keyword index engine.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn hybrid_retrieval(&self, request: HybridSearchRequest) -> Result<Vec<InferenceChunk>>;

    async fn id_based_retrieval(
        &self,
        chunk_requests: Vec<ChunkRequest>,
        filters: IndexFilters,
        batch_retrieval: bool,
    ) -> Result<Vec<InferenceChunk>>;

    async fn index(
        &self,
        chunks: Vec<DocMetadataAwareIndexChunk>,
        params: IndexBatchParams,
    ) -> Result<()>;
}
