use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use search_shared::http::{OAuthSession, RateLimitedClient, RequestAuth};
use search_shared::models::{
    BasicExpertInfo, Document, DocumentSource, ExternalAccess, Section, SlimDocument,
};
use tracing::{debug, warn};

use crate::extract::ContentExtractor;

use super::interfaces::{
    heartbeat_batch, BatchStream, ConnectorError, ConnectorResult, IndexingHeartbeat,
    PollConnector, SlimBatchStream, SlimConnector,
};

const FILES_PER_PAGE: usize = 100;
const FILE_FIELDS: &str =
    "id,name,mimeType,webViewLink,modifiedTime,owners(displayName,emailAddress),permissions(type,emailAddress,domain,id),size";

/// Stable document id from a webViewLink: query string stripped, trailing
/// viewer-mode suffix removed.
pub fn doc_id_from_web_view_link(link: &str) -> String {
    let without_query = link.split('?').next().unwrap_or(link);
    let mut id = without_query.trim_end_matches('/');
    for suffix in ["/edit", "/view", "/preview"] {
        if let Some(stripped) = id.strip_suffix(suffix) {
            id = stripped;
            break;
        }
    }
    id.to_string()
}

/// Synthetic group id for grants inherited from a folder; group sync
/// resolves the folder's members later.
pub const DRIVE_FOLDER_GROUP_PREFIX: &str = "drive_folder:";

/// Permissions from the file payload. Folder-inherited grants become
/// synthetic `drive_folder:` group ids resolved by group sync.
pub fn external_access_from_permissions(permissions: &[serde_json::Value]) -> ExternalAccess {
    let mut emails = BTreeSet::new();
    let mut groups = BTreeSet::new();
    let mut is_public = false;

    for permission in permissions {
        if let Some(folder_id) = permission
            .get("permissionDetails")
            .and_then(|v| v.as_array())
            .and_then(|details| {
                details.iter().find_map(|d| {
                    if d.get("inherited").and_then(|v| v.as_bool()) == Some(true) {
                        d.get("inheritedFrom").and_then(|v| v.as_str())
                    } else {
                        None
                    }
                })
            })
        {
            groups.insert(format!("{DRIVE_FOLDER_GROUP_PREFIX}{folder_id}"));
            continue;
        }
        match permission.get("type").and_then(|v| v.as_str()) {
            Some("user") => {
                if let Some(email) = permission.get("emailAddress").and_then(|v| v.as_str()) {
                    emails.insert(email.to_string());
                }
            }
            Some("group") => {
                if let Some(email) = permission.get("emailAddress").and_then(|v| v.as_str()) {
                    groups.insert(email.to_string());
                }
            }
            Some("domain") => {
                if let Some(domain) = permission.get("domain").and_then(|v| v.as_str()) {
                    groups.insert(format!("domain:{domain}"));
                }
            }
            Some("anyone") => is_public = true,
            _ => {}
        }
    }

    ExternalAccess {
        external_user_emails: emails,
        external_user_group_ids: groups,
        is_public,
    }
}

#[derive(Clone)]
pub struct GoogleDriveConnector {
    http: Arc<RateLimitedClient>,
    oauth: Arc<OAuthSession>,
    batch_size: usize,
    extractor: Arc<ContentExtractor>,
}

impl GoogleDriveConnector {
    pub fn new(
        http: Arc<RateLimitedClient>,
        oauth: Arc<OAuthSession>,
        batch_size: usize,
        extractor: Arc<ContentExtractor>,
    ) -> Self {
        Self {
            http,
            oauth,
            batch_size,
            extractor,
        }
    }

    fn auth(&self) -> RequestAuth {
        RequestAuth::OAuth(self.oauth.clone())
    }

    fn list_url(&self, page_token: Option<&str>, start: Option<DateTime<Utc>>) -> String {
        let mut url = format!(
            "https://www.googleapis.com/drive/v3/files?pageSize={}&fields=nextPageToken,files({})",
            FILES_PER_PAGE, FILE_FIELDS,
        );
        if let Some(start) = start {
            url.push_str(&format!(
                "&q=modifiedTime%20%3E%20%27{}%27",
                start.format("%Y-%m-%dT%H:%M:%S")
            ));
        }
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={token}"));
        }
        url
    }

    async fn file_content(&self, file: &serde_json::Value) -> ConnectorResult<String> {
        let file_id = file
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::BadPayload("drive file without id".into()))?;
        let mime_type = file.get("mimeType").and_then(|v| v.as_str()).unwrap_or("");
        let name = file.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");

        // Native Google formats export as plain text; uploads download raw
        // and go through the extractor
        let url = if mime_type.starts_with("application/vnd.google-apps") {
            if mime_type == "application/vnd.google-apps.folder" {
                return Ok(String::new());
            }
            format!(
                "https://www.googleapis.com/drive/v3/files/{file_id}/export?mimeType=text/plain"
            )
        } else {
            format!("https://www.googleapis.com/drive/v3/files/{file_id}?alt=media")
        };

        let response = self.http.get(&url, &self.auth()).await?;
        let bytes = response.bytes().await.map_err(anyhow::Error::from)?;

        if mime_type.starts_with("application/vnd.google-apps") {
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            Ok(self.extractor.extract(&bytes, Some(name), None).await.text)
        }
    }

    async fn document_from_file(&self, file: &serde_json::Value) -> ConnectorResult<Document> {
        let link = file
            .get("webViewLink")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::BadPayload("drive file without webViewLink".into()))?
            .to_string();
        let name = file
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Untitled")
            .to_string();

        let text = self.file_content(file).await?;

        let owners = file.get("owners").and_then(|v| v.as_array()).map(|owners| {
            owners
                .iter()
                .map(|o| BasicExpertInfo {
                    display_name: o
                        .get("displayName")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    email: o
                        .get("emailAddress")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                })
                .collect::<Vec<_>>()
        });

        let external_access = file
            .get("permissions")
            .and_then(|v| v.as_array())
            .map(|perms| external_access_from_permissions(perms));

        Ok(Document {
            id: doc_id_from_web_view_link(&link),
            sections: vec![Section::text(Some(link), text)],
            source: DocumentSource::GoogleDrive,
            semantic_identifier: name,
            doc_updated_at: file
                .get("modifiedTime")
                .and_then(|v| v.as_str())
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            primary_owners: owners,
            metadata: HashMap::new(),
            external_access,
        })
    }
}

impl GoogleDriveConnector {
    /// Direct member emails of a folder, used by group sync to resolve the
    /// synthetic drive_folder groups.
    pub async fn folder_member_emails(&self, folder_id: &str) -> ConnectorResult<Vec<String>> {
        let url = format!(
            "https://www.googleapis.com/drive/v3/files/{folder_id}/permissions?fields=permissions(type,emailAddress)"
        );
        let body = self.http.get_json(&url, &self.auth()).await?;
        Ok(body
            .get("permissions")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter(|p| {
                matches!(
                    p.get("type").and_then(|v| v.as_str()),
                    Some("user") | Some("group")
                )
            })
            .filter_map(|p| p.get("emailAddress").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .collect())
    }
}

#[async_trait]
impl PollConnector for GoogleDriveConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::GoogleDrive
    }

    fn poll(
        &self,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> BatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let mut page_token: Option<String> = None;
            let mut batch: Vec<Document> = Vec::new();

            loop {
                let url = connector.list_url(page_token.as_deref(), Some(start));
                let body = connector.http.get_json(&url, &connector.auth()).await?;
                let files = body
                    .get("files")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();

                heartbeat_batch(&heartbeat, "gdrive_files", files.len() as i64).await?;

                for file in &files {
                    match connector.document_from_file(file).await {
                        Ok(doc) => {
                            batch.push(doc);
                            if batch.len() >= connector.batch_size {
                                yield std::mem::take(&mut batch);
                            }
                        }
                        Err(e) => warn!("Skipping unreadable Drive file: {}", e),
                    }
                }

                page_token = body
                    .get("nextPageToken")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                if page_token.is_none() {
                    break;
                }
            }

            if !batch.is_empty() {
                yield batch;
            }
        })
    }
}

#[async_trait]
impl SlimConnector for GoogleDriveConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::GoogleDrive
    }

    /// Ids + permissions only, paginated; no content downloads.
    fn slim_documents(
        &self,
        start: Option<DateTime<Utc>>,
        _end: Option<DateTime<Utc>>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> SlimBatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let mut page_token: Option<String> = None;

            loop {
                let url = connector.list_url(page_token.as_deref(), start);
                let body = connector.http.get_json(&url, &connector.auth()).await?;
                let files = body
                    .get("files")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();

                heartbeat_batch(&heartbeat, "gdrive_slim", files.len() as i64).await?;
                debug!("Slim page with {} Drive files", files.len());

                let slim: Vec<SlimDocument> = files
                    .iter()
                    .filter_map(|file| {
                        let link = file.get("webViewLink").and_then(|v| v.as_str())?;
                        let access = file
                            .get("permissions")
                            .and_then(|v| v.as_array())
                            .map(|perms| external_access_from_permissions(perms));
                        Some(SlimDocument {
                            id: doc_id_from_web_view_link(link),
                            external_access: access,
                        })
                    })
                    .collect();

                if !slim.is_empty() {
                    yield slim;
                }

                page_token = body
                    .get("nextPageToken")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                if page_token.is_none() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_strips_query_and_viewer_suffix() {
        assert_eq!(
            doc_id_from_web_view_link("https://docs.google.com/document/d/abc123/edit?usp=sharing"),
            "https://docs.google.com/document/d/abc123"
        );
        assert_eq!(
            doc_id_from_web_view_link("https://drive.google.com/file/d/xyz/view"),
            "https://drive.google.com/file/d/xyz"
        );
        assert_eq!(
            doc_id_from_web_view_link("https://docs.google.com/document/d/abc123"),
            "https://docs.google.com/document/d/abc123"
        );
    }

    #[test]
    fn test_external_access_from_permissions() {
        let permissions = vec![
            serde_json::json!({"type": "user", "emailAddress": "a@ex.com"}),
            serde_json::json!({"type": "group", "emailAddress": "eng@ex.com"}),
            serde_json::json!({"type": "domain", "domain": "ex.com"}),
        ];
        let access = external_access_from_permissions(&permissions);
        assert!(access.external_user_emails.contains("a@ex.com"));
        assert!(access.external_user_group_ids.contains("eng@ex.com"));
        assert!(access.external_user_group_ids.contains("domain:ex.com"));
        assert!(!access.is_public);

        let anyone = vec![serde_json::json!({"type": "anyone"})];
        assert!(external_access_from_permissions(&anyone).is_public);
    }

    #[test]
    fn test_inherited_permission_becomes_folder_group() {
        let permissions = vec![serde_json::json!({
            "type": "user",
            "emailAddress": "a@ex.com",
            "permissionDetails": [{"inherited": true, "inheritedFrom": "folder123"}],
        })];
        let access = external_access_from_permissions(&permissions);
        assert!(access.external_user_group_ids.contains("drive_folder:folder123"));
        // The direct email grant is folded into the folder group
        assert!(access.external_user_emails.is_empty());
    }
}
