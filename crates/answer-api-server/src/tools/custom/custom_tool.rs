use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use search_shared::http::{RateLimitedClient, RequestAuth};
use search_shared::llm::ToolDefinition;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::tools::{Tool, ToolOutput};

use super::freshdesk;
use super::openapi::{MethodSpec, ParamLocation};

/// Persists binary tool responses (images, CSVs) and hands back ids the
/// LLM can reference.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn save(&self, bytes: &[u8], extension: &str) -> Result<String>;
}

pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, bytes: &[u8], extension: &str) -> Result<String> {
        let id = format!("{}.{extension}", Uuid::new_v4());
        tokio::fs::create_dir_all(&self.root).await.ok();
        tokio::fs::write(self.root.join(&id), bytes).await?;
        Ok(id)
    }
}

/// One OpenAPI operation exposed to the LLM as a callable tool.
pub struct CustomTool {
    method_spec: MethodSpec,
    base_url: String,
    headers: HeaderMap,
    user_oauth_token: Option<String>,
    http: Arc<RateLimitedClient>,
    file_store: Arc<dyn FileStore>,
}

impl CustomTool {
    pub fn new(
        method_spec: MethodSpec,
        base_url: String,
        custom_headers: &HashMap<String, String>,
        user_oauth_token: Option<String>,
        http: Arc<RateLimitedClient>,
        file_store: Arc<dyn FileStore>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        let mut has_auth_header = false;
        for (key, value) in custom_headers {
            if key.eq_ignore_ascii_case("authorization") {
                has_auth_header = true;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            } else {
                warn!("Dropping invalid custom header '{}'", key);
            }
        }

        if has_auth_header && user_oauth_token.is_some() {
            warn!(
                "Tool '{}' has both an Authorization header and an OAuth token; \
                 the OAuth token takes precedence",
                method_spec.name
            );
            headers.remove(reqwest::header::AUTHORIZATION);
        }

        Self {
            method_spec,
            base_url,
            headers,
            user_oauth_token,
            http,
            file_store,
        }
    }

    /// Base + path params substituted + query string.
    fn build_url(&self, args: &serde_json::Value) -> Result<String> {
        let mut path = self.method_spec.path.clone();
        let mut query_parts: Vec<(String, String)> = Vec::new();

        for param in &self.method_spec.params {
            let Some(value) = args.get(&param.name) else {
                continue;
            };
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match param.location {
                ParamLocation::Path => {
                    path = path.replace(&format!("{{{}}}", param.name), &rendered);
                }
                ParamLocation::Query => query_parts.push((param.name.clone(), rendered)),
            }
        }

        let mut url = format!("{}{}", self.base_url, path);
        if !query_parts.is_empty() {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(query_parts)
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        Ok(url)
    }

    async fn classify_response(&self, response: reqwest::Response) -> Result<serde_json::Value> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("image/") || content_type.starts_with("text/csv") {
            let extension = if content_type.starts_with("text/csv") {
                "csv"
            } else {
                content_type.strip_prefix("image/").unwrap_or("bin")
            };
            let bytes = response.bytes().await?;
            let file_id = self.file_store.save(&bytes, extension).await?;
            debug!("Stored {} tool response as file {}", content_type, file_id);
            return Ok(serde_json::json!({ "file_ids": [file_id] }));
        }

        if content_type.starts_with("application/json") {
            return Ok(response.json().await?);
        }

        Ok(serde_json::Value::String(response.text().await?))
    }
}

#[async_trait]
impl Tool for CustomTool {
    fn name(&self) -> &str {
        &self.method_spec.name
    }

    fn description(&self) -> &str {
        &self.method_spec.summary
    }

    fn definition(&self) -> ToolDefinition {
        self.method_spec.to_tool_definition()
    }

    async fn run(&self, args: &serde_json::Value) -> Result<ToolOutput> {
        let validated = self.method_spec.validate_args(args)?;
        let url = self.build_url(&validated)?;

        let method = Method::from_bytes(self.method_spec.method.as_bytes())
            .map_err(|_| anyhow!("bad method {}", self.method_spec.method))?;
        let body = validated.get("request_body").cloned();

        let auth = match self.user_oauth_token {
            Some(ref token) => RequestAuth::Bearer(token.clone()),
            None => RequestAuth::None,
        };

        debug!("Custom tool '{}' calling {} {}", self.name(), method, url);
        let response = self
            .http
            .request(method, &url, self.headers.clone(), body, &auth)
            .await?;

        let classified = self.classify_response(response).await?;

        // Freshdesk payloads become citable ticket documents
        if freshdesk::is_freshdesk_url(&url) {
            if let Some((docs, summary)) = freshdesk::tickets_to_docs(&classified, &url) {
                return Ok(ToolOutput {
                    response: summary,
                    display_docs: Some(docs.clone()),
                    context_docs: Some(docs),
                });
            }
        }

        Ok(ToolOutput {
            response: classified,
            context_docs: None,
            display_docs: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::custom::openapi::{openapi_to_method_specs, openapi_to_url};
    use search_shared::http::HttpPoolConfig;

    fn spec() -> serde_json::Value {
        serde_json::json!({
            "servers": [{"url": "https://api.example.com"}],
            "paths": {
                "/items/{item_id}": {
                    "get": {
                        "operationId": "get_item",
                        "summary": "Fetch an item",
                        "parameters": [
                            {"name": "item_id", "in": "path", "required": true,
                             "schema": {"type": "integer"}},
                            {"name": "expand", "in": "query",
                             "schema": {"type": "string"}}
                        ]
                    }
                }
            }
        })
    }

    fn tool() -> CustomTool {
        let parsed = spec();
        let methods = openapi_to_method_specs(&parsed).unwrap();
        CustomTool::new(
            methods.into_iter().next().unwrap(),
            openapi_to_url(&parsed).unwrap(),
            &HashMap::new(),
            None,
            Arc::new(RateLimitedClient::new(HttpPoolConfig::default())),
            Arc::new(LocalFileStore::new(std::env::temp_dir())),
        )
    }

    #[test]
    fn test_url_building_with_path_and_query_params() {
        let tool = tool();
        let url = tool
            .build_url(&serde_json::json!({"item_id": 42, "expand": "full details"}))
            .unwrap();
        assert_eq!(
            url,
            "https://api.example.com/items/42?expand=full+details"
        );
    }

    #[test]
    fn test_oauth_token_overrides_authorization_header() {
        let parsed = spec();
        let methods = openapi_to_method_specs(&parsed).unwrap();
        let headers = HashMap::from([(
            "Authorization".to_string(),
            "Bearer custom".to_string(),
        )]);
        let tool = CustomTool::new(
            methods.into_iter().next().unwrap(),
            "https://api.example.com".to_string(),
            &headers,
            Some("oauth-token".to_string()),
            Arc::new(RateLimitedClient::new(HttpPoolConfig::default())),
            Arc::new(LocalFileStore::new(std::env::temp_dir())),
        );
        assert!(!tool.headers.contains_key(reqwest::header::AUTHORIZATION));
        assert_eq!(tool.user_oauth_token.as_deref(), Some("oauth-token"));
    }
}
