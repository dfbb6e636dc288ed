use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use search_shared::http::{OAuthSession, RateLimitedClient};
use search_shared::models::DocumentSource;

use crate::config::Settings;
use crate::extract::ContentExtractor;
use crate::image::ImageProcessorClient;

use super::confluence::ConfluenceConnector;
use super::file::FileConnector;
use super::freshdesk::FreshdeskConnector;
use super::freshdesk_solutions::FreshdeskSolutionsConnector;
use super::google_drive::GoogleDriveConnector;
use super::interfaces::{
    BatchStream, CheckpointedConnector, ConnectorError, ConnectorResult, IndexingHeartbeat,
    LoadConnector, PollConnector, SlimBatchStream, SlimConnector,
};
use super::salesforce::SalesforceConnector;
use super::web::WebConnector;

/// Everything a connector might need, injected so tests can substitute
/// fakes.
pub struct ConnectorDeps {
    pub http: Arc<RateLimitedClient>,
    pub extractor: Arc<ContentExtractor>,
    pub image_processor: Option<Arc<ImageProcessorClient>>,
    pub file_store_root: PathBuf,
    pub batch_size: usize,
    pub settings: Settings,
}

/// How the worker drives a connector for one attempt.
pub enum ConnectorRunner {
    /// Lazily streamed batches (load and poll connectors).
    Stream(BatchStream),
    /// Pull-based; the worker persists the checkpoint between pulls.
    Checkpointed(Arc<dyn CheckpointedConnector>),
}

/// Tagged dispatch over the source adapters.
pub enum SourceConnector {
    Web(WebConnector),
    GoogleDrive(GoogleDriveConnector),
    Confluence(ConfluenceConnector),
    Freshdesk(FreshdeskConnector),
    FreshdeskSolutions(FreshdeskSolutionsConnector),
    Salesforce(SalesforceConnector),
    File(FileConnector),
}

fn oauth_from_credentials(
    prefix: &str,
    credentials: &serde_json::Value,
) -> ConnectorResult<Arc<OAuthSession>> {
    let get = |key: &str| -> ConnectorResult<String> {
        credentials
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ConnectorError::MissingCredential(format!("{prefix}: {key}")))
    };
    Ok(Arc::new(OAuthSession::new(
        format!("{prefix}_{}", get("client_id")?),
        get("token_url")?,
        get("client_id")?,
        get("client_secret")?,
        get("access_token")?,
        credentials
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        None,
    )))
}

impl SourceConnector {
    pub fn instantiate(
        source: DocumentSource,
        config: &serde_json::Value,
        credentials: &serde_json::Value,
        deps: &ConnectorDeps,
    ) -> ConnectorResult<Self> {
        match source {
            DocumentSource::Web => Ok(SourceConnector::Web(WebConnector::from_config(
                deps.http.clone(),
                config,
                deps.batch_size,
                deps.settings.connectors.web_max_pages,
                deps.image_processor.clone(),
            )?)),
            DocumentSource::GoogleDrive => {
                let oauth = oauth_from_credentials("gdrive", credentials)?;
                Ok(SourceConnector::GoogleDrive(GoogleDriveConnector::new(
                    deps.http.clone(),
                    oauth,
                    deps.batch_size,
                    deps.extractor.clone(),
                )))
            }
            DocumentSource::Confluence => {
                Ok(SourceConnector::Confluence(ConfluenceConnector::from_credentials(
                    deps.http.clone(),
                    config,
                    credentials,
                    deps.batch_size,
                    deps.settings.connectors.attachment_size_limit_bytes,
                    deps.extractor.clone(),
                )?))
            }
            DocumentSource::Freshdesk => {
                Ok(SourceConnector::Freshdesk(FreshdeskConnector::from_credentials(
                    deps.http.clone(),
                    credentials,
                    deps.batch_size,
                )?))
            }
            DocumentSource::FreshdeskSolutions => Ok(SourceConnector::FreshdeskSolutions(
                FreshdeskSolutionsConnector::from_credentials(
                    deps.http.clone(),
                    credentials,
                    deps.batch_size,
                )?,
            )),
            DocumentSource::Salesforce => {
                let oauth = oauth_from_credentials("salesforce", credentials)?;
                let instance_url = credentials
                    .get("instance_url")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ConnectorError::MissingCredential("salesforce: instance_url".into())
                    })?
                    .to_string();
                Ok(SourceConnector::Salesforce(SalesforceConnector::new(
                    deps.http.clone(),
                    oauth,
                    instance_url,
                    config
                        .get("object_types")
                        .and_then(|v| v.as_array())
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                .collect()
                        }),
                    deps.batch_size,
                    deps.settings.connectors.salesforce_max_parallelism,
                )))
            }
            DocumentSource::File => Ok(SourceConnector::File(FileConnector::from_config(
                config,
                deps.file_store_root.clone(),
                deps.extractor.clone(),
            )?)),
            other => Err(ConnectorError::BadPayload(format!(
                "no connector registered for source {other}"
            ))),
        }
    }

    /// Uniform entry point for an indexing run. Poll-capable sources get the
    /// window; load-only sources replay from their fixed starting state.
    pub fn runner(
        self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
        from_beginning: bool,
    ) -> ConnectorRunner {
        match self {
            SourceConnector::Web(c) => ConnectorRunner::Stream(c.load(heartbeat)),
            SourceConnector::FreshdeskSolutions(c) => ConnectorRunner::Stream(c.load(heartbeat)),
            SourceConnector::Freshdesk(c) => {
                if from_beginning {
                    ConnectorRunner::Stream(c.load(heartbeat))
                } else {
                    ConnectorRunner::Stream(c.poll(start, end, heartbeat))
                }
            }
            SourceConnector::GoogleDrive(c) => {
                let effective_start = if from_beginning {
                    DateTime::<Utc>::UNIX_EPOCH
                } else {
                    start
                };
                ConnectorRunner::Stream(c.poll(effective_start, end, heartbeat))
            }
            SourceConnector::Confluence(c) => {
                let effective_start = if from_beginning {
                    DateTime::<Utc>::UNIX_EPOCH
                } else {
                    start
                };
                ConnectorRunner::Stream(c.poll(effective_start, end, heartbeat))
            }
            SourceConnector::Salesforce(c) => {
                let effective_start = if from_beginning {
                    DateTime::<Utc>::UNIX_EPOCH
                } else {
                    start
                };
                ConnectorRunner::Stream(c.poll(effective_start, end, heartbeat))
            }
            SourceConnector::File(c) => ConnectorRunner::Checkpointed(Arc::new(c)),
        }
    }

    /// Slim stream for permission sync, for sources that support it.
    pub fn slim_runner(
        self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        heartbeat: Arc<dyn IndexingHeartbeat>,
    ) -> Option<SlimBatchStream> {
        match self {
            SourceConnector::GoogleDrive(c) => {
                Some(SlimConnector::slim_documents(&c, start, end, heartbeat))
            }
            SourceConnector::Confluence(c) => {
                Some(SlimConnector::slim_documents(&c, start, end, heartbeat))
            }
            _ => None,
        }
    }
}
