use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::settings::EmbeddingConfig;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| anyhow!("embedding server returned nothing for query"))
    }
}

/// Client for the embedding model server. Calls are batched; the server
/// sees at most `batch_size` texts per request.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    batch_size: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.clone(),
            batch_size: config.batch_size.max(1),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            debug!("Embedding batch of {}", batch.len());
            let response = self
                .client
                .post(format!("{}/embed", self.base_url))
                .json(&EmbeddingRequest { texts: batch })
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(anyhow!("embedding server error: {} - {}", status, body));
            }

            let parsed: EmbeddingResponse = response.json().await?;
            if parsed.embeddings.len() != batch.len() {
                return Err(anyhow!(
                    "embedding server returned {} vectors for {} texts",
                    parsed.embeddings.len(),
                    batch.len()
                ));
            }
            all.extend(parsed.embeddings);
        }

        Ok(all)
    }
}
