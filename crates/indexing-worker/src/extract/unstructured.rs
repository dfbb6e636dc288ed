use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct UnstructuredElement {
    text: Option<String>,
}

/// Client for a hosted Unstructured deployment. Extraction failures are
/// always recoverable; callers fall through to local parsing.
pub struct UnstructuredClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl UnstructuredClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    pub async fn extract(&self, bytes: &[u8], file_name: &str) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("files", part);

        let response = self
            .client
            .post(&self.api_url)
            .header("unstructured-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("unstructured returned {}", response.status()));
        }

        let elements: Vec<UnstructuredElement> = response.json().await?;
        Ok(elements
            .into_iter()
            .filter_map(|e| e.text)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
