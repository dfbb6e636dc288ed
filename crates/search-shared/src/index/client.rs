use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::models::{DocMetadataAwareIndexChunk, InferenceChunk};

use super::{ChunkRequest, DocumentIndex, HybridSearchRequest, IndexBatchParams, IndexFilters};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    chunks: Vec<InferenceChunk>,
}

/// HTTP client for the index engine process.
pub struct HttpDocumentIndex {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDocumentIndex {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("index engine error: {} - {}", status, text));
        }
        Ok(response)
    }
}

#[async_trait]
impl DocumentIndex for HttpDocumentIndex {
    async fn hybrid_retrieval(&self, request: HybridSearchRequest) -> Result<Vec<InferenceChunk>> {
        debug!(
            "Hybrid retrieval: top_k={} alpha={}",
            request.num_to_retrieve, request.hybrid_alpha
        );
        let response = self
            .post("/search/hybrid", serde_json::to_value(&request)?)
            .await?;
        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.chunks)
    }

    async fn id_based_retrieval(
        &self,
        chunk_requests: Vec<ChunkRequest>,
        filters: IndexFilters,
        batch_retrieval: bool,
    ) -> Result<Vec<InferenceChunk>> {
        let body = serde_json::json!({
            "chunk_requests": chunk_requests,
            "filters": filters,
            "batch_retrieval": batch_retrieval,
        });
        let response = self.post("/search/by-id", body).await?;
        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.chunks)
    }

    async fn index(
        &self,
        chunks: Vec<DocMetadataAwareIndexChunk>,
        params: IndexBatchParams,
    ) -> Result<()> {
        let body = serde_json::json!({
            "chunks": chunks,
            "batch_params": params,
        });
        self.post("/index", body).await?;
        Ok(())
    }
}
