use std::collections::HashMap;

use chrono::{DateTime, Utc};
use search_shared::models::{DocumentSource, MetadataValue};
use tracing::debug;

use crate::answer::LlmDoc;

const FRESHDESK_ID_PREFIX: &str = "FRESHDESK_";

pub fn is_freshdesk_url(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.ends_with("freshdesk.com")))
        .unwrap_or(false)
}

fn status_name(code: i64) -> &'static str {
    match code {
        2 => "open",
        3 => "pending",
        4 => "resolved",
        5 => "closed",
        _ => "unknown",
    }
}

/// Turn a Freshdesk API payload (one ticket or a list) into citable ticket
/// documents plus a compact summary for the LLM. None when the payload does
/// not look like tickets.
pub fn tickets_to_docs(
    payload: &serde_json::Value,
    request_url: &str,
) -> Option<(Vec<LlmDoc>, serde_json::Value)> {
    let tickets: Vec<&serde_json::Value> = match payload {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(_) if payload.get("id").is_some() => vec![payload],
        _ => return None,
    };

    let domain = url::Url::parse(request_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))?;

    let mut docs = Vec::new();
    for ticket in tickets {
        let ticket_id = ticket.get("id").and_then(|v| v.as_i64())?;
        let subject = ticket
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or("(no subject)")
            .to_string();
        let description = ticket
            .get("description_text")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let status = ticket
            .get("status")
            .and_then(|v| v.as_i64())
            .map(status_name)
            .unwrap_or("unknown");

        let mut content = format!(
            "Ticket {ticket_id}: {subject}\nStatus: {status}\n{description}"
        );
        if let Some(conversations) = ticket.get("conversations").and_then(|v| v.as_array()) {
            content.push_str("\nConversations:");
            for conversation in conversations {
                if let Some(body) = conversation.get("body_text").and_then(|v| v.as_str()) {
                    content.push_str("\n- ");
                    content.push_str(body);
                }
            }
        }

        let link = format!("https://{domain}/helpdesk/tickets/{ticket_id}");
        let mut metadata: HashMap<String, MetadataValue> = HashMap::new();
        metadata.insert("status".to_string(), status.into());
        metadata.insert("id".to_string(), ticket_id.to_string().into());

        docs.push(LlmDoc {
            document_id: format!("{FRESHDESK_ID_PREFIX}{link}"),
            semantic_identifier: subject,
            link: Some(link),
            source: DocumentSource::Freshdesk,
            blurb: content.chars().take(200).collect(),
            content,
            metadata,
            updated_at: ticket
                .get("updated_at")
                .and_then(|v| v.as_str())
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00")).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        });
    }

    if docs.is_empty() {
        return None;
    }
    debug!("Synthesized {} citable Freshdesk tickets", docs.len());

    let summary = serde_json::json!({
        "tickets": docs
            .iter()
            .enumerate()
            .map(|(idx, doc)| serde_json::json!({
                "number": idx + 1,
                "title": doc.semantic_identifier,
                "content": doc.content,
            }))
            .collect::<Vec<_>>(),
    });
    Some((docs, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_freshdesk_url() {
        assert!(is_freshdesk_url("https://acme.freshdesk.com/api/v2/tickets"));
        assert!(!is_freshdesk_url("https://api.example.com/tickets"));
    }

    #[test]
    fn test_ticket_list_becomes_citable_docs() {
        let payload = serde_json::json!([
            {"id": 1, "subject": "Login broken", "status": 2,
             "description_text": "Cannot log in",
             "updated_at": "2024-01-01T00:00:00Z"},
            {"id": 2, "subject": "Slow search", "status": 4,
             "description_text": "Search takes minutes"},
        ]);
        let (docs, summary) =
            tickets_to_docs(&payload, "https://acme.freshdesk.com/api/v2/tickets").unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(
            docs[0].document_id,
            "FRESHDESK_https://acme.freshdesk.com/helpdesk/tickets/1"
        );
        assert_eq!(docs[0].source, DocumentSource::Freshdesk);
        assert!(docs[1].content.contains("Status: resolved"));
        assert_eq!(summary["tickets"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_non_ticket_payload_is_ignored() {
        let payload = serde_json::json!({"message": "ok"});
        assert!(tickets_to_docs(&payload, "https://acme.freshdesk.com/api/v2/whatever").is_none());
    }
}
