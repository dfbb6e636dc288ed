use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use search_shared::http::{RateLimitedClient, RequestAuth};
use search_shared::models::{Document, DocumentSource, MetadataValue, Section};
use tracing::debug;

use super::interfaces::{
    heartbeat_batch, BatchStream, ConnectorError, ConnectorResult, IndexingHeartbeat,
    LoadConnector,
};

const SOLUTIONS_ID_PREFIX: &str = "FRESHDESK_SOLUTIONS_";
const ARTICLES_PER_PAGE: usize = 100;

/// Knowledge-base articles: categories, their folders, then paginated
/// articles per folder.
#[derive(Clone)]
pub struct FreshdeskSolutionsConnector {
    http: Arc<RateLimitedClient>,
    domain: String,
    api_key: String,
    password: String,
    batch_size: usize,
}

impl FreshdeskSolutionsConnector {
    pub fn from_credentials(
        http: Arc<RateLimitedClient>,
        credentials: &serde_json::Value,
        batch_size: usize,
    ) -> ConnectorResult<Self> {
        let get = |key: &str| -> ConnectorResult<String> {
            credentials
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| ConnectorError::MissingCredential(format!("freshdesk: {key}")))
        };
        Ok(Self {
            http,
            domain: get("freshdesk_domain")?,
            api_key: get("freshdesk_api_key")?,
            password: get("freshdesk_password")?,
            batch_size,
        })
    }

    fn auth(&self) -> RequestAuth {
        RequestAuth::Basic {
            username: self.api_key.clone(),
            password: self.password.clone(),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("https://{}.freshdesk.com/api/v2{path}", self.domain)
    }

    async fn list(&self, path: &str) -> ConnectorResult<Vec<serde_json::Value>> {
        let body = self.http.get_json(&self.api(path), &self.auth()).await?;
        body.as_array()
            .cloned()
            .ok_or_else(|| ConnectorError::BadPayload(format!("{path} payload is not a list")))
    }

    fn document_from_article(
        &self,
        article: &serde_json::Value,
        category_name: &str,
        folder_name: &str,
    ) -> Option<Document> {
        let title = article.get("title").and_then(|v| v.as_str())?.to_string();
        let article_id = article.get("id").and_then(|v| v.as_i64())?;
        let description = article
            .get("description_text")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let link = format!(
            "https://{}.freshdesk.com/support/solutions/articles/{}",
            self.domain, article_id
        );

        let text = format!("Category: {category_name}, Folder: {folder_name}. {description}");

        let mut metadata: HashMap<String, MetadataValue> = HashMap::new();
        metadata.insert("category".to_string(), category_name.into());
        metadata.insert("folder".to_string(), folder_name.into());
        if let Some(status) = article.get("status").and_then(|v| v.as_i64()) {
            metadata.insert(
                "status".to_string(),
                if status == 2 { "published" } else { "draft" }.into(),
            );
        }

        Some(Document {
            id: format!("{SOLUTIONS_ID_PREFIX}{link}"),
            sections: vec![Section::text(Some(link), text)],
            source: DocumentSource::FreshdeskSolutions,
            semantic_identifier: title,
            doc_updated_at: article
                .get("updated_at")
                .and_then(|v| v.as_str())
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00")).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            primary_owners: None,
            metadata,
            external_access: None,
        })
    }
}

#[async_trait]
impl LoadConnector for FreshdeskSolutionsConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::FreshdeskSolutions
    }

    fn load(&self, heartbeat: Arc<dyn IndexingHeartbeat>) -> BatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let mut batch: Vec<Document> = Vec::new();

            let categories = connector.list("/solutions/categories").await?;
            for category in &categories {
                let Some(category_id) = category.get("id").and_then(|v| v.as_i64()) else {
                    continue;
                };
                let category_name = category
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Uncategorized")
                    .to_string();

                let folders = connector
                    .list(&format!("/solutions/categories/{category_id}/folders"))
                    .await?;
                for folder in &folders {
                    let Some(folder_id) = folder.get("id").and_then(|v| v.as_i64()) else {
                        continue;
                    };
                    let folder_name = folder
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Unfiled")
                        .to_string();

                    let mut page = 1u64;
                    loop {
                        let articles = connector
                            .list(&format!(
                                "/solutions/folders/{folder_id}/articles?per_page={ARTICLES_PER_PAGE}&page={page}"
                            ))
                            .await?;
                        heartbeat_batch(&heartbeat, "freshdesk_articles", articles.len() as i64)
                            .await?;
                        debug!(
                            "Folder {} page {}: {} articles",
                            folder_name,
                            page,
                            articles.len()
                        );

                        let short_page = articles.len() < ARTICLES_PER_PAGE;
                        for article in &articles {
                            if let Some(doc) = connector.document_from_article(
                                article,
                                &category_name,
                                &folder_name,
                            ) {
                                batch.push(doc);
                                if batch.len() >= connector.batch_size {
                                    yield std::mem::take(&mut batch);
                                }
                            }
                        }

                        if short_page {
                            break;
                        }
                        page += 1;
                    }
                }
            }

            if !batch.is_empty() {
                yield batch;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_shared::http::{HttpPoolConfig, RateLimitedClient};

    fn connector() -> FreshdeskSolutionsConnector {
        FreshdeskSolutionsConnector {
            http: Arc::new(RateLimitedClient::new(HttpPoolConfig::default())),
            domain: "acme".to_string(),
            api_key: "key".to_string(),
            password: "x".to_string(),
            batch_size: 10,
        }
    }

    #[test]
    fn test_article_document_id_and_metadata() {
        let article = serde_json::json!({
            "id": 7001,
            "title": "Resetting your password",
            "description_text": "Go to settings.",
            "status": 2,
            "updated_at": "2024-05-01T10:00:00Z",
        });
        let doc = connector()
            .document_from_article(&article, "Accounts", "Self-service")
            .unwrap();
        assert_eq!(
            doc.id,
            "FRESHDESK_SOLUTIONS_https://acme.freshdesk.com/support/solutions/articles/7001"
        );
        assert_eq!(doc.semantic_identifier, "Resetting your password");
        assert_eq!(doc.metadata["status"].as_single(), Some("published"));
        assert!(doc.sections[0].content().contains("Category: Accounts"));
    }
}
