use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::access::ExternalAccess;

/// Kind of upstream system a document was pulled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "document_source", rename_all = "snake_case")]
pub enum DocumentSource {
    Web,
    GoogleDrive,
    Confluence,
    Freshdesk,
    FreshdeskSolutions,
    Salesforce,
    Sharepoint,
    Slack,
    Github,
    File,
    ChatSummary,
    IngestionApi,
    NotApplicable,
}

impl DocumentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentSource::Web => "web",
            DocumentSource::GoogleDrive => "google_drive",
            DocumentSource::Confluence => "confluence",
            DocumentSource::Freshdesk => "freshdesk",
            DocumentSource::FreshdeskSolutions => "freshdesk_solutions",
            DocumentSource::Salesforce => "salesforce",
            DocumentSource::Sharepoint => "sharepoint",
            DocumentSource::Slack => "slack",
            DocumentSource::Github => "github",
            DocumentSource::File => "file",
            DocumentSource::ChatSummary => "chat_summary",
            DocumentSource::IngestionApi => "ingestion_api",
            DocumentSource::NotApplicable => "not_applicable",
        }
    }
}

impl std::fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata values are either a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    One(String),
    Many(Vec<String>),
}

impl MetadataValue {
    pub fn as_joined_str(&self) -> String {
        match self {
            MetadataValue::One(s) => s.clone(),
            MetadataValue::Many(items) => items.join(", "),
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            MetadataValue::One(s) => Some(s.as_str()),
            MetadataValue::Many(_) => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::One(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::One(s)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(items: Vec<String>) -> Self {
        MetadataValue::Many(items)
    }
}

/// An ordered piece of a document. Image sections reference content produced
/// by the image processing pipeline rather than raw text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Section {
    Text {
        link: Option<String>,
        text: String,
    },
    Image {
        link: Option<String>,
        image_id: String,
        text: String,
    },
}

impl Section {
    pub fn text(link: Option<String>, text: impl Into<String>) -> Self {
        Section::Text {
            link,
            text: text.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Section::Text { text, .. } => text,
            Section::Image { text, .. } => text,
        }
    }

    pub fn link(&self) -> Option<&str> {
        match self {
            Section::Text { link, .. } => link.as_deref(),
            Section::Image { link, .. } => link.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicExpertInfo {
    pub display_name: Option<String>,
    pub email: Option<String>,
}

/// A fully extracted document ready for chunking and indexing.
///
/// Ids are source-prefixed and human-stable, e.g.
/// `FRESHDESK_https://<domain>/helpdesk/tickets/{id}` or the canonical URL
/// for web pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub sections: Vec<Section>,
    pub source: DocumentSource,
    pub semantic_identifier: String,
    pub doc_updated_at: Option<DateTime<Utc>>,
    pub primary_owners: Option<Vec<BasicExpertInfo>>,
    pub metadata: HashMap<String, MetadataValue>,
    /// Snapshot of upstream permissions, when the connector can provide them
    /// at fetch time.
    pub external_access: Option<ExternalAccess>,
}

impl Document {
    pub fn full_text(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.content())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Identity + permission metadata only, used for ACL sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlimDocument {
    pub id: String,
    pub external_access: Option<ExternalAccess>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_value_joined() {
        let one = MetadataValue::One("open".to_string());
        assert_eq!(one.as_joined_str(), "open");

        let many = MetadataValue::Many(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(many.as_joined_str(), "a, b");
    }

    #[test]
    fn test_document_full_text_joins_sections() {
        let doc = Document {
            id: "https://ex/p".to_string(),
            sections: vec![
                Section::text(None, "first"),
                Section::text(Some("https://ex/p#s2".to_string()), "second"),
            ],
            source: DocumentSource::Web,
            semantic_identifier: "Example".to_string(),
            doc_updated_at: None,
            primary_owners: None,
            metadata: HashMap::new(),
            external_access: None,
        };

        assert_eq!(doc.full_text(), "first\nsecond");
    }
}
