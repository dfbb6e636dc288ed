use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use search_shared::http::{RateLimitedClient, RequestAuth};
use search_shared::models::{Document, DocumentSource, MetadataValue, Section};
use tracing::{debug, info, warn};

use super::interfaces::{
    heartbeat_batch, BatchStream, ConnectorError, ConnectorResult, IndexingHeartbeat,
    LoadConnector, PollConnector,
};

const FRESHDESK_ID_PREFIX: &str = "FRESHDESK_";
const TICKETS_PER_PAGE: usize = 100;
const CONVERSATIONS_PER_PAGE: usize = 100;
/// The tickets endpoint stops serving past this page; pagination re-bases on
/// the last seen `updated_at` and starts over from page 1.
const PAGE_CAP: u64 = 300;

const TICKET_FIELDS_TO_INCLUDE: &[&str] = &[
    "fr_escalated",
    "spam",
    "priority",
    "source",
    "status",
    "type",
    "is_escalated",
    "tags",
    "cc_emails",
    "fwd_emails",
    "reply_cc_emails",
    "ticket_cc_emails",
    "support_email",
    "to_emails",
];

pub fn source_name(code: i64) -> &'static str {
    match code {
        1 => "Email",
        2 => "Portal",
        3 => "Phone",
        7 => "Chat",
        9 => "Feedback Widget",
        10 => "Outbound Email",
        _ => "Unknown Source Type",
    }
}

pub fn priority_name(code: i64) -> &'static str {
    match code {
        1 => "low",
        2 => "medium",
        3 => "high",
        4 => "urgent",
        _ => "Unknown Priority",
    }
}

pub fn status_name(code: i64) -> &'static str {
    match code {
        2 => "open",
        3 => "pending",
        4 => "resolved",
        5 => "closed",
        16 => "Work in Progress",
        17 => "Pending with CSM",
        18 => "Pending with Customer",
        19 => "Pending with Cloud",
        _ => "Unknown Status",
    }
}

/// Decides the next tickets-endpoint request after a page is consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum PageStep {
    Next { page: u64 },
    Rebase { updated_since: String },
    Done,
}

pub fn next_page_step(
    page: u64,
    tickets_on_page: usize,
    last_updated_at: Option<&str>,
) -> PageStep {
    if tickets_on_page < TICKETS_PER_PAGE {
        return PageStep::Done;
    }
    if page >= PAGE_CAP {
        match last_updated_at {
            Some(updated_at) => PageStep::Rebase {
                updated_since: updated_at.to_string(),
            },
            None => PageStep::Done,
        }
    } else {
        PageStep::Next { page: page + 1 }
    }
}

#[derive(Clone)]
pub struct FreshdeskConnector {
    http: Arc<RateLimitedClient>,
    domain: String,
    api_key: String,
    password: String,
    batch_size: usize,
}

impl FreshdeskConnector {
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

    fn tickets_url(&self, page: u64, updated_since: Option<&str>) -> String {
        let mut url = format!(
            "https://{}.freshdesk.com/api/v2/tickets?include=description&per_page={}&page={}",
            self.domain, TICKETS_PER_PAGE, page
        );
        if let Some(since) = updated_since {
            url.push_str(&format!("&updated_since={since}"));
        }
        url
    }

    async fn fetch_ticket_page(
        &self,
        page: u64,
        updated_since: Option<&str>,
    ) -> ConnectorResult<Vec<serde_json::Value>> {
        let url = self.tickets_url(page, updated_since);
        let body = self.http.get_json(&url, &self.auth()).await?;
        let tickets = body
            .as_array()
            .cloned()
            .ok_or_else(|| ConnectorError::BadPayload("tickets payload is not a list".into()))?;
        info!("Fetched {} tickets from Freshdesk (page {})", tickets.len(), page);
        Ok(tickets)
    }

    /// All conversations for a ticket, 100 per page until a short page.
    async fn fetch_all_conversations(&self, ticket_id: i64) -> ConnectorResult<String> {
        let base = format!(
            "https://{}.freshdesk.com/api/v2/tickets/{}/conversations",
            self.domain, ticket_id
        );

        let mut all: Vec<serde_json::Value> = Vec::new();
        let mut page = 1u64;
        loop {
            let url = format!("{base}?per_page={CONVERSATIONS_PER_PAGE}&page={page}");
            let body = self.http.get_json(&url, &self.auth()).await?;
            let conversations = body.as_array().cloned().unwrap_or_default();
            if conversations.is_empty() {
                break;
            }
            debug!(
                "Fetched {} conversations from page {} for ticket {}",
                conversations.len(),
                page,
                ticket_id
            );
            let short_page = conversations.len() < CONVERSATIONS_PER_PAGE;
            all.extend(conversations);
            if short_page {
                break;
            }
            page += 1;
        }

        if all.is_empty() {
            return Ok(" No conversations available.".to_string());
        }

        let mut text = String::new();
        for (count, conversation) in all.iter().enumerate() {
            let private_tag = if conversation.get("private").and_then(|v| v.as_bool()) == Some(true)
            {
                " (Private Note)"
            } else {
                ""
            };
            let body_text = conversation
                .get("body_text")
                .and_then(|v| v.as_str())
                .unwrap_or("No content available");
            text.push_str(&format!(
                " Conversation {}{}: {}",
                count + 1,
                private_tag,
                crate::extract::html::strip_html(body_text)
            ));
        }
        Ok(text)
    }

    async fn document_from_ticket(&self, ticket: &serde_json::Value) -> ConnectorResult<Document> {
        let ticket_id = ticket
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ConnectorError::BadPayload("ticket without id".into()))?;

        let status = ticket
            .get("status")
            .and_then(|v| v.as_i64())
            .map(status_name)
            .unwrap_or("");
        let priority = ticket
            .get("priority")
            .and_then(|v| v.as_i64())
            .map(priority_name)
            .unwrap_or("");

        let mut text = format!("Ticket ID: {ticket_id}, Status: {status}, Priority: {priority}, ");

        let description = ticket
            .get("description_text")
            .or_else(|| ticket.get("description"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        text.push_str(&format!(
            "Ticket Description : {}",
            crate::extract::html::strip_html(description)
        ));

        text.push_str(" Conversations:");
        text.push_str(&self.fetch_all_conversations(ticket_id).await?);

        // The link doubles as the unique part of the document id
        let link = format!(
            "https://{}.freshdesk.com/helpdesk/tickets/{}",
            self.domain, ticket_id
        );
        let metadata = ticket_metadata(ticket, &link);

        let doc_updated_at = ticket
            .get("updated_at")
            .and_then(|v| v.as_str())
            .and_then(parse_freshdesk_time);

        Ok(Document {
            id: format!("{FRESHDESK_ID_PREFIX}{link}"),
            sections: vec![Section::text(Some(link), text)],
            source: DocumentSource::Freshdesk,
            semantic_identifier: ticket
                .get("subject")
                .and_then(|v| v.as_str())
                .unwrap_or("None")
                .to_string(),
            doc_updated_at,
            primary_owners: None,
            metadata,
            external_access: None,
        })
    }

    fn ticket_stream(
        &self,
        start: Option<DateTime<Utc>>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> BatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let mut page: u64 = 1;
            let mut updated_since = start.map(|s| s.to_rfc3339());
            // Guards re-base loops against re-yielding already seen tickets
            let mut seen_ids: HashSet<i64> = HashSet::new();
            let mut doc_batch: Vec<Document> = Vec::new();

            loop {
                let tickets = connector
                    .fetch_ticket_page(page, updated_since.as_deref())
                    .await?;
                heartbeat_batch(&heartbeat, "freshdesk_tickets", tickets.len() as i64).await?;

                let last_updated_at = tickets
                    .last()
                    .and_then(|t| t.get("updated_at"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());

                let page_len = tickets.len();
                for ticket in &tickets {
                    let Some(id) = ticket.get("id").and_then(|v| v.as_i64()) else {
                        continue;
                    };
                    if !seen_ids.insert(id) {
                        continue;
                    }
                    let doc = connector.document_from_ticket(ticket).await?;
                    doc_batch.push(doc);
                    if doc_batch.len() >= connector.batch_size {
                        yield std::mem::take(&mut doc_batch);
                    }
                }

                match next_page_step(page, page_len, last_updated_at.as_deref()) {
                    PageStep::Next { page: next } => page = next,
                    PageStep::Rebase { updated_since: since } => {
                        warn!(
                            "Reached Freshdesk page cap ({}), re-basing on updated_since={}",
                            PAGE_CAP, since
                        );
                        page = 1;
                        updated_since = Some(since);
                    }
                    PageStep::Done => break,
                }
            }

            if !doc_batch.is_empty() {
                yield doc_batch;
            }
        })
    }
}

fn parse_freshdesk_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn ticket_metadata(ticket: &serde_json::Value, link: &str) -> HashMap<String, MetadataValue> {
    let mut metadata: HashMap<String, MetadataValue> = HashMap::new();
    let mut emails: HashSet<String> = HashSet::new();

    if let Some(fields) = ticket.as_object() {
        for (key, value) in fields {
            if !TICKET_FIELDS_TO_INCLUDE.contains(&key.as_str()) {
                continue;
            }
            let stringified: MetadataValue = match value {
                serde_json::Value::Array(items) if !items.is_empty() => MetadataValue::Many(
                    items
                        .iter()
                        .map(|item| match item {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                ),
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) if s.is_empty() => continue,
                serde_json::Value::String(s) => MetadataValue::One(s.clone()),
                serde_json::Value::Array(_) => continue,
                other => MetadataValue::One(other.to_string()),
            };

            if key.contains("email") {
                match stringified {
                    MetadataValue::One(s) => {
                        emails.insert(s);
                    }
                    MetadataValue::Many(items) => emails.extend(items),
                }
            } else {
                metadata.insert(key.clone(), stringified);
            }
        }
    }

    if !emails.is_empty() {
        let mut emails: Vec<String> = emails.into_iter().collect();
        emails.sort();
        metadata.insert("emails".to_string(), MetadataValue::Many(emails));
    }

    // Numeric codes become the names users know
    if let Some(code) = ticket.get("source").and_then(|v| v.as_i64()) {
        metadata.insert("source".to_string(), source_name(code).into());
    }
    if let Some(code) = ticket.get("priority").and_then(|v| v.as_i64()) {
        metadata.insert("priority".to_string(), priority_name(code).into());
    }
    if let Some(code) = ticket.get("status").and_then(|v| v.as_i64()) {
        metadata.insert("status".to_string(), status_name(code).into());
    }
    if let Some(id) = ticket.get("id").and_then(|v| v.as_i64()) {
        metadata.insert("id".to_string(), id.to_string().into());
    }
    for key in ["created_at", "updated_at", "subject"] {
        if let Some(value) = ticket.get(key).and_then(|v| v.as_str()) {
            metadata.insert(key.to_string(), value.into());
        }
    }

    if let Some(due_by) = ticket
        .get("due_by")
        .and_then(|v| v.as_str())
        .and_then(parse_freshdesk_time)
    {
        metadata.insert("overdue".to_string(), (Utc::now() > due_by).to_string().into());
    }

    metadata.insert("current_url".to_string(), link.into());

    metadata
}

#[async_trait]
impl LoadConnector for FreshdeskConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Freshdesk
    }

    fn load(&self, heartbeat: Arc<dyn IndexingHeartbeat>) -> BatchStream {
        self.ticket_stream(None, heartbeat)
    }
}

#[async_trait]
impl PollConnector for FreshdeskConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Freshdesk
    }

    fn poll(
        &self,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> BatchStream {
        // `end` is not applied: the search endpoint needed for upper bounds
        // cannot include descriptions, so late tickets are re-fetched on the
        // next poll instead.
        self.ticket_stream(Some(start), heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_maps() {
        assert_eq!(status_name(2), "open");
        assert_eq!(status_name(16), "Work in Progress");
        assert_eq!(status_name(99), "Unknown Status");
        assert_eq!(priority_name(4), "urgent");
        assert_eq!(source_name(9), "Feedback Widget");
    }

    #[test]
    fn test_short_page_ends_pagination() {
        assert_eq!(next_page_step(1, 50, Some("2024-01-01T00:00:00Z")), PageStep::Done);
    }

    #[test]
    fn test_full_page_advances() {
        assert_eq!(
            next_page_step(5, TICKETS_PER_PAGE, None),
            PageStep::Next { page: 6 }
        );
    }

    #[test]
    fn test_page_cap_rebases_on_last_updated_at() {
        assert_eq!(
            next_page_step(300, TICKETS_PER_PAGE, Some("2024-03-04T05:06:07Z")),
            PageStep::Rebase {
                updated_since: "2024-03-04T05:06:07Z".to_string()
            }
        );
        // Without a timestamp to re-base on there is nothing safe to do
        assert_eq!(next_page_step(300, TICKETS_PER_PAGE, None), PageStep::Done);
    }

    #[test]
    fn test_ticket_metadata_converts_codes_and_merges_emails() {
        let ticket = serde_json::json!({
            "id": 42,
            "status": 2,
            "priority": 4,
            "source": 1,
            "subject": "Printer on fire",
            "cc_emails": ["a@ex.com", "b@ex.com"],
            "to_emails": ["a@ex.com"],
            "tags": ["hardware"],
            "updated_at": "2024-01-02T03:04:05Z",
        });
        let metadata = ticket_metadata(&ticket, "https://d.freshdesk.com/helpdesk/tickets/42");

        assert_eq!(metadata["status"].as_single(), Some("open"));
        assert_eq!(metadata["priority"].as_single(), Some("urgent"));
        assert_eq!(metadata["source"].as_single(), Some("Email"));
        match &metadata["emails"] {
            MetadataValue::Many(emails) => {
                assert_eq!(emails, &vec!["a@ex.com".to_string(), "b@ex.com".to_string()]);
            }
            other => panic!("expected list, got {other:?}"),
        }
        assert_eq!(metadata["id"].as_single(), Some("42"));
    }
}
