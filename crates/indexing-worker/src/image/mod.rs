use std::collections::HashMap;

use anyhow::{anyhow, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::settings::ImageServerConfig;

pub const EMBEDDED_IMAGES_HEADER: &str = "=== EMBEDDED IMAGES ===";

#[derive(Debug, Serialize)]
struct ProcessRequest<'a> {
    image_base64: String,
    file_name: &'a str,
    include_ocr: bool,
    include_description: bool,
    include_embedding: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    claude_api_key: Option<&'a str>,
    claude_provider: &'a str,
    claude_model: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessedImage {
    pub text: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub has_embedding: bool,
}

/// Client for the image model server process. On any failure the caller gets
/// a minimal local fallback rather than an error so document indexing keeps
/// moving.
pub struct ImageProcessorClient {
    client: reqwest::Client,
    base_url: String,
    claude_api_key: Option<String>,
    claude_provider: String,
    claude_model: String,
}

impl ImageProcessorClient {
    pub fn new(config: &ImageServerConfig, claude_api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_default(),
            base_url: format!("http://{}:{}", config.host, config.port),
            claude_api_key,
            claude_provider: "anthropic".to_string(),
            claude_model: "claude-3-5-sonnet-20241022".to_string(),
        }
    }

    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Image model server health check failed: {}", e);
                false
            }
        }
    }

    async fn process_remote(&self, image: &[u8], file_name: &str) -> Result<ProcessedImage> {
        let request = ProcessRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(image),
            file_name,
            include_ocr: true,
            include_description: true,
            include_embedding: true,
            claude_api_key: self.claude_api_key.as_deref(),
            claude_provider: &self.claude_provider,
            claude_model: &self.claude_model,
        };

        let response = self
            .client
            .post(format!("{}/image/process", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "image model server returned {}",
                response.status()
            ));
        }

        Ok(response.json().await?)
    }

    /// OCR + description + embedding, with a degraded local result when the
    /// model server is unreachable.
    pub async fn process(&self, image: &[u8], file_name: &str) -> ProcessedImage {
        match self.process_remote(image, file_name).await {
            Ok(processed) => {
                debug!(
                    "Processed image {} ({} chars, embedding={})",
                    file_name,
                    processed.text.len(),
                    processed.has_embedding
                );
                processed
            }
            Err(e) => {
                warn!(
                    "Image model server failed for {}, using local fallback: {}",
                    file_name, e
                );
                local_fallback(file_name)
            }
        }
    }
}

fn local_fallback(file_name: &str) -> ProcessedImage {
    let mut metadata = HashMap::new();
    metadata.insert("has_ocr_text".to_string(), serde_json::json!(false));
    metadata.insert("has_description".to_string(), serde_json::json!(false));
    metadata.insert("has_image_embedding".to_string(), serde_json::json!(false));
    metadata.insert("embedding_model".to_string(), serde_json::json!(null));
    metadata.insert("embedding_dim".to_string(), serde_json::json!(0));

    ProcessedImage {
        text: format!("[Image: {file_name}]"),
        metadata,
        embedding: None,
        has_embedding: false,
    }
}

/// Append image-derived content to a parent page's text so one dense hit
/// surfaces both.
pub fn append_embedded_image_content(page_text: &str, image_texts: &[(String, String)]) -> String {
    if image_texts.is_empty() {
        return page_text.to_string();
    }

    let mut out = String::with_capacity(page_text.len() + 256);
    out.push_str(page_text);
    out.push_str("\n\n");
    out.push_str(EMBEDDED_IMAGES_HEADER);
    for (file_name, text) in image_texts {
        out.push_str(&format!("\n\n[{file_name}]\n{text}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_embedded_image_content() {
        let combined = append_embedded_image_content(
            "page body",
            &[("diagram.png".to_string(), "a system diagram".to_string())],
        );
        assert!(combined.starts_with("page body"));
        assert!(combined.contains(EMBEDDED_IMAGES_HEADER));
        assert!(combined.contains("a system diagram"));
    }

    #[test]
    fn test_no_images_leaves_text_untouched() {
        assert_eq!(append_embedded_image_content("page body", &[]), "page body");
    }

    #[test]
    fn test_local_fallback_metadata_keys() {
        let fallback = local_fallback("x.png");
        for key in [
            "has_ocr_text",
            "has_description",
            "has_image_embedding",
            "embedding_model",
            "embedding_dim",
        ] {
            assert!(fallback.metadata.contains_key(key), "missing {key}");
        }
    }
}
