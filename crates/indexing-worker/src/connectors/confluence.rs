use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use search_shared::http::{RateLimitedClient, RequestAuth};
use search_shared::models::{
    Document, DocumentSource, ExternalAccess, MetadataValue, Section, SlimDocument,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::extract::{html, ContentExtractor};

use super::interfaces::{
    heartbeat_batch, BatchStream, ConnectorError, ConnectorResult, IndexingHeartbeat,
    PollConnector, SlimBatchStream, SlimConnector,
};

const PAGE_LIMIT: usize = 50;
/// Embedded page macros inline at most this deep.
const MAX_INLINE_DEPTH: usize = 3;

static USER_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<ri:user[^>]*ri:account-id="([^"]+)"[^>]*/?>"#).expect("static regex")
});

static PAGE_INCLUDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<ac:structured-macro[^>]*ac:name="(?:include|excerpt-include)".*?ri:content-title="([^"]+)".*?</ac:structured-macro>"#,
    )
    .expect("static regex")
});

/// Display-name lookups cached for the lifetime of one sync run; nothing is
/// shared across attempts.
#[derive(Default)]
pub struct UserDisplayNameCache {
    names: Mutex<HashMap<String, String>>,
}

impl UserDisplayNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_fetch(
        &self,
        account_id: &str,
        fetch: impl std::future::Future<Output = Option<String>>,
    ) -> String {
        {
            let names = self.names.lock().await;
            if let Some(name) = names.get(account_id) {
                return name.clone();
            }
        }
        let resolved = fetch.await.unwrap_or_else(|| "Unknown User".to_string());
        self.names
            .lock()
            .await
            .insert(account_id.to_string(), resolved.clone());
        resolved
    }
}

#[derive(Clone)]
pub struct ConfluenceConnector {
    http: Arc<RateLimitedClient>,
    base_url: String,
    username: String,
    api_token: String,
    batch_size: usize,
    attachment_size_limit: u64,
    extractor: Arc<ContentExtractor>,
}

impl ConfluenceConnector {
    pub fn from_credentials(
        http: Arc<RateLimitedClient>,
        config: &serde_json::Value,
        credentials: &serde_json::Value,
        batch_size: usize,
        attachment_size_limit: u64,
        extractor: Arc<ContentExtractor>,
    ) -> ConnectorResult<Self> {
        let base_url = config
            .get("wiki_base")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::BadPayload("confluence needs wiki_base".into()))?
            .trim_end_matches('/')
            .to_string();
        let get_cred = |key: &str| -> ConnectorResult<String> {
            credentials
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| ConnectorError::MissingCredential(format!("confluence: {key}")))
        };
        Ok(Self {
            http,
            base_url,
            username: get_cred("confluence_username")?,
            api_token: get_cred("confluence_access_token")?,
            batch_size,
            attachment_size_limit,
            extractor,
        })
    }

    fn auth(&self) -> RequestAuth {
        RequestAuth::Basic {
            username: self.username.clone(),
            password: self.api_token.clone(),
        }
    }

    async fn fetch_user_display_name(&self, account_id: &str) -> Option<String> {
        let url = format!("{}/rest/api/user?accountId={}", self.base_url, account_id);
        match self.http.get_json(&url, &self.auth()).await {
            Ok(body) => body
                .get("displayName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            Err(e) => {
                debug!("User lookup failed for {}: {}", account_id, e);
                None
            }
        }
    }

    async fn fetch_page_storage_by_title(&self, title: &str) -> Option<String> {
        let url = format!(
            "{}/rest/api/content?title={}&expand=body.storage&limit=1",
            self.base_url,
            urlencode(title)
        );
        let body = self.http.get_json(&url, &self.auth()).await.ok()?;
        body.get("results")?
            .as_array()?
            .first()?
            .pointer("/body/storage/value")?
            .as_str()
            .map(|s| s.to_string())
    }

    /// Replace user references with display names, then inline embedded page
    /// macros. The visited-titles set breaks include cycles.
    async fn render_storage(
        &self,
        storage: &str,
        user_cache: &UserDisplayNameCache,
        visited_titles: &mut HashSet<String>,
        depth: usize,
    ) -> String {
        let mut rendered = storage.to_string();

        // User references, one tag at a time so ranges stay valid
        loop {
            let Some((range, account_id)) = USER_REF_RE
                .captures(&rendered)
                .map(|c| (c.get(0).expect("group 0 always present").range(), c[1].to_string()))
            else {
                break;
            };
            let name = user_cache
                .get_or_fetch(&account_id, self.fetch_user_display_name(&account_id))
                .await;
            rendered.replace_range(range, &format!("@{name}"));
        }

        // Embedded page macros
        if depth < MAX_INLINE_DEPTH {
            loop {
                let Some((whole, title)) = PAGE_INCLUDE_RE.captures(&rendered).map(|c| {
                    (
                        c.get(0).expect("group 0 always present").range(),
                        c[1].to_string(),
                    )
                }) else {
                    break;
                };

                let replacement = if visited_titles.insert(title.clone()) {
                    match self.fetch_page_storage_by_title(&title).await {
                        Some(inner) => {
                            Box::pin(self.render_storage(
                                &inner,
                                user_cache,
                                visited_titles,
                                depth + 1,
                            ))
                            .await
                        }
                        None => {
                            warn!("Included page '{}' not found", title);
                            String::new()
                        }
                    }
                } else {
                    debug!("Skipping already-inlined page '{}'", title);
                    String::new()
                };

                rendered.replace_range(whole, &replacement);
            }
        }

        rendered
    }

    async fn attachment_text(&self, page_id: &str) -> String {
        let url = format!(
            "{}/rest/api/content/{}/child/attachment?expand=extensions",
            self.base_url, page_id
        );
        let Ok(body) = self.http.get_json(&url, &self.auth()).await else {
            return String::new();
        };

        let mut out = String::new();
        for attachment in body
            .get("results")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let Some(title) = attachment.get("title").and_then(|v| v.as_str()) else {
                continue;
            };
            let size = attachment
                .pointer("/extensions/fileSize")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if size > self.attachment_size_limit {
                warn!(
                    "Skipping attachment {} ({} bytes > {} limit)",
                    title, size, self.attachment_size_limit
                );
                continue;
            }
            let Some(download) = attachment.pointer("/_links/download").and_then(|v| v.as_str())
            else {
                continue;
            };
            let download_url = format!("{}{}", self.base_url, download);
            let Ok(response) = self.http.get(&download_url, &self.auth()).await else {
                continue;
            };
            let Ok(bytes) = response.bytes().await else {
                continue;
            };
            let extracted = self.extractor.extract(&bytes, Some(title), None).await;
            if !extracted.text.trim().is_empty() {
                out.push_str(&format!("\n\nAttachment {title}:\n{}", extracted.text));
            }
        }
        out
    }

    async fn document_from_page(
        &self,
        page: &serde_json::Value,
        user_cache: &UserDisplayNameCache,
    ) -> ConnectorResult<Document> {
        let page_id = page
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::BadPayload("page without id".into()))?;
        let title = page
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Untitled")
            .to_string();
        let storage = page
            .pointer("/body/storage/value")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let mut visited_titles: HashSet<String> = HashSet::from([title.clone()]);
        let rendered = self
            .render_storage(storage, user_cache, &mut visited_titles, 0)
            .await;
        let mut text = html::strip_html(&rendered);
        text.push_str(&self.attachment_text(page_id).await);

        let webui = page
            .pointer("/_links/webui")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let link = format!("{}{}", self.base_url, webui);

        let doc_updated_at = page
            .pointer("/version/when")
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let mut metadata: HashMap<String, MetadataValue> = HashMap::new();
        if let Some(space) = page.pointer("/space/key").and_then(|v| v.as_str()) {
            metadata.insert("space".to_string(), space.into());
        }

        Ok(Document {
            id: link.clone(),
            sections: vec![Section::text(Some(link), text)],
            source: DocumentSource::Confluence,
            semantic_identifier: title,
            doc_updated_at,
            primary_owners: None,
            metadata,
            external_access: None,
        })
    }
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// View-restriction payload → external ACL. A page with no read
/// restrictions is visible to everyone who can see the space, which maps to
/// public here; group sync narrows the space-level groups separately.
pub fn external_access_from_restrictions(page: &serde_json::Value) -> ExternalAccess {
    let mut emails = std::collections::BTreeSet::new();
    let mut groups = std::collections::BTreeSet::new();

    for user in page
        .pointer("/restrictions/read/restrictions/user/results")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        if let Some(email) = user.get("email").and_then(|v| v.as_str()) {
            if !email.is_empty() {
                emails.insert(email.to_string());
            }
        }
    }
    for group in page
        .pointer("/restrictions/read/restrictions/group/results")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        if let Some(name) = group.get("name").and_then(|v| v.as_str()) {
            groups.insert(name.to_string());
        }
    }

    let unrestricted = emails.is_empty() && groups.is_empty();
    ExternalAccess {
        external_user_emails: emails,
        external_user_group_ids: groups,
        is_public: unrestricted,
    }
}

#[async_trait]
impl SlimConnector for ConfluenceConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Confluence
    }

    /// Page ids + read restrictions only; no bodies, no attachments.
    fn slim_documents(
        &self,
        _start: Option<DateTime<Utc>>,
        _end: Option<DateTime<Utc>>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> SlimBatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let mut start_at = 0usize;
            loop {
                let url = format!(
                    "{}/rest/api/content?type=page&limit={}&start={}&expand=restrictions.read.restrictions.user,restrictions.read.restrictions.group",
                    connector.base_url, PAGE_LIMIT, start_at,
                );
                let body = connector.http.get_json(&url, &connector.auth()).await?;
                let results = body
                    .get("results")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();

                heartbeat_batch(&heartbeat, "confluence_slim", results.len() as i64).await?;

                let page_count = results.len();
                let slim: Vec<SlimDocument> = results
                    .iter()
                    .filter_map(|page| {
                        let webui = page.pointer("/_links/webui")?.as_str()?;
                        Some(SlimDocument {
                            id: format!("{}{}", connector.base_url, webui),
                            external_access: Some(external_access_from_restrictions(page)),
                        })
                    })
                    .collect();

                if !slim.is_empty() {
                    yield slim;
                }

                if page_count < PAGE_LIMIT {
                    break;
                }
                start_at += PAGE_LIMIT;
            }
        })
    }
}

#[async_trait]
impl PollConnector for ConfluenceConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Confluence
    }

    fn poll(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> BatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let user_cache = UserDisplayNameCache::new();
            let cql = format!(
                "type=page and lastModified >= '{}' and lastModified <= '{}' order by lastModified",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M"),
            );

            let mut start_at = 0usize;
            let mut batch: Vec<Document> = Vec::new();
            loop {
                let url = format!(
                    "{}/rest/api/content/search?cql={}&limit={}&start={}&expand=body.storage,version,space",
                    connector.base_url,
                    urlencode(&cql),
                    PAGE_LIMIT,
                    start_at,
                );
                let body = connector.http.get_json(&url, &connector.auth()).await?;
                let results = body
                    .get("results")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();

                heartbeat_batch(&heartbeat, "confluence_pages", results.len() as i64).await?;

                let page_count = results.len();
                for page in &results {
                    match connector.document_from_page(page, &user_cache).await {
                        Ok(doc) => {
                            batch.push(doc);
                            if batch.len() >= connector.batch_size {
                                yield std::mem::take(&mut batch);
                            }
                        }
                        Err(e) => warn!("Skipping unreadable Confluence page: {}", e),
                    }
                }

                if page_count < PAGE_LIMIT {
                    break;
                }
                start_at += PAGE_LIMIT;
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

    #[test]
    fn test_user_ref_regex_matches_storage_format() {
        let storage = r#"<p>Ping <ri:user ri:account-id="abc-123"/> please</p>"#;
        let captures = USER_REF_RE.captures(storage).unwrap();
        assert_eq!(&captures[1], "abc-123");
    }

    #[test]
    fn test_page_include_regex_extracts_title() {
        let storage = r#"<ac:structured-macro ac:name="include"><ac:parameter><ri:page ri:content-title="Runbook" /></ac:parameter></ac:structured-macro>"#;
        let captures = PAGE_INCLUDE_RE.captures(storage).unwrap();
        assert_eq!(&captures[1], "Runbook");
    }

    #[test]
    fn test_unrestricted_page_is_public() {
        let page = serde_json::json!({"id": "1"});
        let access = external_access_from_restrictions(&page);
        assert!(access.is_public);
        assert!(access.external_user_emails.is_empty());
    }

    #[test]
    fn test_read_restrictions_map_to_acl() {
        let page = serde_json::json!({
            "restrictions": {"read": {"restrictions": {
                "user": {"results": [{"email": "a@ex.com"}, {"email": ""}]},
                "group": {"results": [{"name": "engineering"}]},
            }}},
        });
        let access = external_access_from_restrictions(&page);
        assert!(!access.is_public);
        assert!(access.external_user_emails.contains("a@ex.com"));
        assert_eq!(access.external_user_emails.len(), 1);
        assert!(access.external_user_group_ids.contains("engineering"));
    }

    #[tokio::test]
    async fn test_user_cache_fetches_once() {
        let cache = UserDisplayNameCache::new();
        let first = cache
            .get_or_fetch("id-1", async { Some("Ada".to_string()) })
            .await;
        assert_eq!(first, "Ada");
        // Second lookup must come from the cache even if the fetch fails
        let second = cache.get_or_fetch("id-1", async { None }).await;
        assert_eq!(second, "Ada");
    }
}
