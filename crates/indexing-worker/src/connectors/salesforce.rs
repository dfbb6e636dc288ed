use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use search_shared::http::{OAuthSession, RateLimitedClient, RequestAuth};
use search_shared::models::{Document, DocumentSource, MetadataValue, Section};
use tracing::{debug, info, warn};

use super::interfaces::{
    heartbeat_batch, BatchStream, ConnectorError, ConnectorResult, IndexingHeartbeat,
    PollConnector,
};

const DEFAULT_OBJECT_TYPES: &[&str] = &["Account", "Contact", "Opportunity", "Case"];
const API_VERSION: &str = "v59.0";
const JOB_POLL_INTERVAL_SECS: u64 = 5;
const JOB_POLL_MAX_ATTEMPTS: u32 = 60;

/// Bulk CSV export per object type. Downloads are memory-heavy, so at most
/// `max_parallelism` (≤ 4) run at once.
#[derive(Clone)]
pub struct SalesforceConnector {
    http: Arc<RateLimitedClient>,
    oauth: Arc<OAuthSession>,
    instance_url: String,
    object_types: Vec<String>,
    batch_size: usize,
    max_parallelism: usize,
}

impl SalesforceConnector {
    pub fn new(
        http: Arc<RateLimitedClient>,
        oauth: Arc<OAuthSession>,
        instance_url: String,
        object_types: Option<Vec<String>>,
        batch_size: usize,
        max_parallelism: usize,
    ) -> Self {
        Self {
            http,
            oauth,
            instance_url: instance_url.trim_end_matches('/').to_string(),
            object_types: object_types.unwrap_or_else(|| {
                DEFAULT_OBJECT_TYPES.iter().map(|s| s.to_string()).collect()
            }),
            batch_size,
            max_parallelism: max_parallelism.clamp(1, 4),
        }
    }

    fn auth(&self) -> RequestAuth {
        RequestAuth::OAuth(self.oauth.clone())
    }

    /// Create a bulk query job, poll it to completion, download the CSV.
    async fn download_object_csv(
        &self,
        object_type: &str,
        start: DateTime<Utc>,
    ) -> ConnectorResult<String> {
        let jobs_url = format!(
            "{}/services/data/{}/jobs/query",
            self.instance_url, API_VERSION
        );
        let query = format!(
            "SELECT FIELDS(STANDARD) FROM {} WHERE LastModifiedDate > {}",
            object_type,
            start.format("%Y-%m-%dT%H:%M:%SZ")
        );

        let create_body = serde_json::json!({
            "operation": "query",
            "query": query,
        });
        let response = self
            .http
            .post_json(&jobs_url, &create_body, &self.auth())
            .await?;
        let job: serde_json::Value = response.json().await.map_err(anyhow::Error::from)?;
        let job_id = job
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::BadPayload("bulk job without id".into()))?
            .to_string();

        debug!("Created bulk query job {} for {}", job_id, object_type);

        let status_url = format!("{jobs_url}/{job_id}");
        for _ in 0..JOB_POLL_MAX_ATTEMPTS {
            let status = self.http.get_json(&status_url, &self.auth()).await?;
            match status.get("state").and_then(|v| v.as_str()) {
                Some("JobComplete") => {
                    let results_url = format!("{status_url}/results");
                    let response = self.http.get(&results_url, &self.auth()).await?;
                    return Ok(response.text().await.map_err(anyhow::Error::from)?);
                }
                Some("Failed") | Some("Aborted") => {
                    return Err(ConnectorError::BadPayload(format!(
                        "bulk job {job_id} for {object_type} failed"
                    )));
                }
                state => {
                    debug!("Bulk job {} state: {:?}", job_id, state);
                    tokio::time::sleep(std::time::Duration::from_secs(JOB_POLL_INTERVAL_SECS))
                        .await;
                }
            }
        }

        Err(ConnectorError::BadPayload(format!(
            "bulk job {job_id} for {object_type} did not complete in time"
        )))
    }

    fn instance_url(&self) -> &str {
        &self.instance_url
    }
}

/// One CSV row becomes one document; the header row names the metadata keys.
pub fn documents_from_csv(
    object_type: &str,
    instance_url: &str,
    csv_text: &str,
) -> Vec<Document> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(|h| h.to_string()).collect(),
        Err(e) => {
            warn!("Unreadable CSV header for {}: {}", object_type, e);
            return Vec::new();
        }
    };

    let mut documents = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else {
            continue;
        };

        let mut fields: HashMap<String, String> = HashMap::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            if !value.is_empty() {
                fields.insert(header.clone(), value.to_string());
            }
        }

        let Some(record_id) = fields.get("Id").cloned() else {
            continue;
        };

        let name = fields
            .get("Name")
            .or_else(|| fields.get("Subject"))
            .cloned()
            .unwrap_or_else(|| format!("{object_type} {record_id}"));

        let text = fields
            .iter()
            .filter(|(k, _)| k.as_str() != "Id")
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");

        let link = format!("{instance_url}/{record_id}");
        let mut metadata: HashMap<String, MetadataValue> = HashMap::new();
        metadata.insert("object_type".to_string(), object_type.into());

        let doc_updated_at = fields
            .get("LastModifiedDate")
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw.replace("+0000", "+00:00")).ok())
            .map(|dt| dt.with_timezone(&Utc));

        documents.push(Document {
            id: format!("SALESFORCE_{link}"),
            sections: vec![Section::text(Some(link), text)],
            source: DocumentSource::Salesforce,
            semantic_identifier: name,
            doc_updated_at,
            primary_owners: None,
            metadata,
            external_access: None,
        });
    }

    documents
}

#[async_trait]
impl PollConnector for SalesforceConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Salesforce
    }

    fn poll(
        &self,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> BatchStream {
        let connector = self.clone();
        Box::pin(try_stream! {
            let mut pending = connector.object_types.clone().into_iter();
            let mut in_flight = FuturesUnordered::new();

            let spawn = |object_type: String, connector: SalesforceConnector| async move {
                let csv = connector.download_object_csv(&object_type, start).await;
                (object_type, csv)
            };

            for _ in 0..connector.max_parallelism {
                if let Some(object_type) = pending.next() {
                    in_flight.push(spawn(object_type, connector.clone()));
                }
            }

            while let Some((object_type, csv_result)) = in_flight.next().await {
                if let Some(next_object) = pending.next() {
                    in_flight.push(spawn(next_object, connector.clone()));
                }

                let csv_text = match csv_result {
                    Ok(csv_text) => csv_text,
                    Err(ConnectorError::Cancelled) => Err(ConnectorError::Cancelled)?,
                    Err(e) => {
                        warn!("Bulk download failed for {}: {}", object_type, e);
                        continue;
                    }
                };

                let documents =
                    documents_from_csv(&object_type, connector.instance_url(), &csv_text);
                info!("{}: {} records from bulk CSV", object_type, documents.len());
                heartbeat_batch(&heartbeat, "salesforce_objects", documents.len() as i64).await?;

                // One CSV yields one or more batches, per object type
                for chunk in documents.chunks(connector.batch_size) {
                    yield chunk.to_vec();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documents_from_csv() {
        let csv_text = "Id,Name,Industry,LastModifiedDate\n\
                        001A,Acme,Manufacturing,2024-02-01T00:00:00.000+0000\n\
                        001B,Globex,,2024-02-02T00:00:00.000+0000\n";
        let docs = documents_from_csv("Account", "https://org.my.salesforce.com", csv_text);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "SALESFORCE_https://org.my.salesforce.com/001A");
        assert_eq!(docs[0].semantic_identifier, "Acme");
        assert!(docs[0].sections[0].content().contains("Industry: Manufacturing"));
        // Empty fields are dropped rather than serialized as blanks
        assert!(!docs[1].sections[0].content().contains("Industry"));
    }

    #[test]
    fn test_rows_without_id_are_skipped() {
        let csv_text = "Name,Industry\nAcme,Manufacturing\n";
        let docs = documents_from_csv("Account", "https://org.my.salesforce.com", csv_text);
        assert!(docs.is_empty());
    }
}
