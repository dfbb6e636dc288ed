pub mod censor;
pub mod prune;
pub mod relevance;
pub mod rephrase;
pub mod runner;

use std::sync::Arc;

use anyhow::Result;
use search_shared::index::{DocumentIndex, HybridSearchRequest, IndexFilters};
use search_shared::llm::{LlmClient, LlmLimiter, RetryPolicy};
use search_shared::models::InferenceChunk;
use tracing::{debug, info, warn};

use crate::config::settings::RetrievalConfig;

/// Seam over the embedding server for query vectors.
#[async_trait::async_trait]
pub trait QueryEmbedder: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

pub struct HttpQueryEmbedder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQueryEmbedder {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl QueryEmbedder for HttpQueryEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&serde_json::json!({ "texts": [text] }))
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        let embedding = body
            .get("embeddings")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| serde_json::from_value::<Vec<f32>>(v.clone()).ok())
            .ok_or_else(|| anyhow::anyhow!("embedding server returned no vector"))?;
        Ok(embedding)
    }
}

/// Query → rephrase → hybrid retrieval → large-chunk resolution → image
/// co-retrieval → optional rerank → LLM relevance → pruning.
pub struct RetrievalPipeline {
    index: Arc<dyn DocumentIndex>,
    embedder: Arc<dyn QueryEmbedder>,
    llm: Arc<dyn LlmClient>,
    fast_llm: Arc<dyn LlmClient>,
    limiter: LlmLimiter,
    retry: RetryPolicy,
    access_lookup: Option<Arc<dyn censor::AccessLookup>>,
    config: RetrievalConfig,
}

pub struct RetrievalRequest {
    pub query: String,
    pub history: Vec<search_shared::llm::LlmMessage>,
    pub filters: IndexFilters,
    pub user_email: Option<String>,
    pub user_group_ids: Vec<String>,
    pub skip_rerank: bool,
    pub skip_llm_relevance: bool,
}

impl RetrievalPipeline {
    pub fn new(
        index: Arc<dyn DocumentIndex>,
        embedder: Arc<dyn QueryEmbedder>,
        llm: Arc<dyn LlmClient>,
        fast_llm: Arc<dyn LlmClient>,
        limiter: LlmLimiter,
        access_lookup: Option<Arc<dyn censor::AccessLookup>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            llm,
            fast_llm,
            limiter,
            retry: RetryPolicy::default(),
            access_lookup,
            config,
        }
    }

    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<Vec<InferenceChunk>> {
        // 1. Rephrase against history
        let query = rephrase::history_based_query_rephrase(
            &request.query,
            &request.history,
            self.fast_llm.as_ref(),
        )
        .await;

        // 2. Hybrid retrieval, with multilingual expansion when configured
        let queries = rephrase::expanded_queries(
            &query,
            &self.config.multilingual_expansion,
            self.fast_llm.as_ref(),
        )
        .await;

        let mut result_sets = Vec::new();
        for q in &queries {
            match self.retrieve_one(q, &request.filters).await {
                Ok(chunks) => result_sets.push(chunks),
                Err(e) => warn!("Retrieval failed for rephrasing '{}': {}", q, e),
            }
        }
        let top_chunks = runner::combine_retrieval_results(result_sets);

        if top_chunks.is_empty() {
            warn!("Hybrid search returned no results for '{}'", query);
            return Ok(Vec::new());
        }

        // Sources with post-query censoring are filtered against stored
        // ACL snapshots before anything downstream sees them
        let top_chunks = match (&self.access_lookup, &request.user_email) {
            (Some(lookup), Some(email)) => {
                censor::censor_chunks(
                    lookup.as_ref(),
                    email,
                    &request.user_group_ids,
                    top_chunks,
                )
                .await
            }
            _ => top_chunks,
        };

        // 4. Image documents pull in their source pages
        let top_chunks = runner::enhance_with_source_pages(
            self.index.as_ref(),
            top_chunks,
            &request.filters,
            self.config.top_k,
        )
        .await;

        // 5. Optional rerank of the top N
        let top_chunks = if self.config.rerank_enabled && !request.skip_rerank {
            self.rerank(&query, top_chunks).await
        } else {
            top_chunks
        };

        // 6. LLM relevance filter + 7. prune
        let top_chunks = if self.config.llm_relevance_enabled && !request.skip_llm_relevance {
            let relevant = relevance::llm_batch_eval_sections(
                &query,
                &top_chunks,
                self.llm.as_ref(),
                &self.limiter,
                &self.retry,
                self.config.relevance_batch_size,
            )
            .await;
            prune::drop_irrelevant(top_chunks, &relevant)
        } else {
            top_chunks
        };

        let pruned = prune::prune_to_token_budget(top_chunks, self.config.context_token_budget);
        info!("Retrieval produced {} sections after pruning", pruned.len());
        Ok(pruned)
    }

    /// One hybrid query with large-chunk resolution applied.
    async fn retrieve_one(
        &self,
        query: &str,
        filters: &IndexFilters,
    ) -> Result<Vec<InferenceChunk>> {
        let embedding = self.embedder.embed_query(query).await?;
        let keywords = rephrase::extract_keywords(query);

        let top_chunks = self
            .index
            .hybrid_retrieval(HybridSearchRequest {
                query: query.to_string(),
                query_embedding: embedding,
                final_keywords: keywords,
                filters: filters.clone(),
                hybrid_alpha: self.config.hybrid_alpha,
                time_decay_multiplier: self.config.recency_bias,
                num_to_retrieve: self.config.top_k,
                offset: 0,
            })
            .await?;

        runner::resolve_large_chunks(self.index.as_ref(), top_chunks, filters).await
    }

    /// Lightweight lexical re-scoring of the top N. The external reranker
    /// service slot sits behind this same signature.
    async fn rerank(&self, query: &str, mut chunks: Vec<InferenceChunk>) -> Vec<InferenceChunk> {
        let top_n = self.config.rerank_top_n.min(chunks.len());
        debug!("Reranking top {} of {} chunks", top_n, chunks.len());

        let query_terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        let head = &mut chunks[..top_n];
        for chunk in head.iter_mut() {
            let content = chunk.content.to_lowercase();
            let overlap = query_terms
                .iter()
                .filter(|term| content.contains(term.as_str()))
                .count();
            let lexical = overlap as f32 / query_terms.len().max(1) as f32;
            // Blend, weighted toward the original hybrid score
            let original = chunk.score_or_zero();
            chunk.score = Some(original * 0.7 + lexical * 0.3);
        }
        chunks.sort_by(|a, b| {
            b.score_or_zero()
                .partial_cmp(&a.score_or_zero())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks
    }
}
