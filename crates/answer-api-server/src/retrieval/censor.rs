use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use search_shared::models::{DocumentSource, ExternalAccess, InferenceChunk};
use sqlx::PgPool;
use tracing::{debug, warn};

/// Sources whose ACLs cannot be projected onto the index ahead of time and
/// must be checked against the stored snapshots after every query.
const CENSORED_SOURCES: &[DocumentSource] = &[DocumentSource::Salesforce];

/// Seam over the stored DocExternalAccess snapshots.
#[async_trait]
pub trait AccessLookup: Send + Sync {
    async fn access_for(&self, doc_ids: &[String]) -> Result<HashMap<String, ExternalAccess>>;
}

pub struct SqlAccessLookup {
    pool: PgPool,
}

impl SqlAccessLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AccessRow {
    doc_id: String,
    external_user_emails: Vec<String>,
    external_user_group_ids: Vec<String>,
    is_public: bool,
}

#[async_trait]
impl AccessLookup for SqlAccessLookup {
    async fn access_for(&self, doc_ids: &[String]) -> Result<HashMap<String, ExternalAccess>> {
        let rows = sqlx::query_as::<_, AccessRow>(
            r#"SELECT * FROM doc_external_access WHERE doc_id = ANY($1)"#,
        )
        .bind(doc_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.doc_id,
                    ExternalAccess {
                        external_user_emails: row.external_user_emails.into_iter().collect(),
                        external_user_group_ids: row.external_user_group_ids.into_iter().collect(),
                        is_public: row.is_public,
                    },
                )
            })
            .collect())
    }
}

/// Drop chunks from censored sources the user cannot see. A chunk with no
/// stored snapshot is dropped too: without an ACL there is no basis to show
/// it.
pub async fn censor_chunks(
    lookup: &dyn AccessLookup,
    user_email: &str,
    user_group_ids: &[String],
    chunks: Vec<InferenceChunk>,
) -> Vec<InferenceChunk> {
    let censored_ids: Vec<String> = chunks
        .iter()
        .filter(|c| CENSORED_SOURCES.contains(&c.source))
        .map(|c| c.document_id.clone())
        .collect();
    if censored_ids.is_empty() {
        return chunks;
    }

    let access_map = match lookup.access_for(&censored_ids).await {
        Ok(map) => map,
        Err(e) => {
            // Fail closed: none of the censored chunks survive
            warn!("Access lookup failed, dropping censored-source chunks: {}", e);
            return chunks
                .into_iter()
                .filter(|c| !CENSORED_SOURCES.contains(&c.source))
                .collect();
        }
    };

    let before = chunks.len();
    let kept: Vec<InferenceChunk> = chunks
        .into_iter()
        .filter(|chunk| {
            if !CENSORED_SOURCES.contains(&chunk.source) {
                return true;
            }
            let Some(access) = access_map.get(&chunk.document_id) else {
                return false;
            };
            access.is_public
                || access.external_user_emails.contains(user_email)
                || access
                    .external_user_group_ids
                    .iter()
                    .any(|g| user_group_ids.contains(g))
        })
        .collect();

    if kept.len() != before {
        debug!("Censoring dropped {} chunks", before - kept.len());
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct StubLookup {
        map: HashMap<String, ExternalAccess>,
    }

    #[async_trait]
    impl AccessLookup for StubLookup {
        async fn access_for(&self, _ids: &[String]) -> Result<HashMap<String, ExternalAccess>> {
            Ok(self.map.clone())
        }
    }

    fn chunk(doc_id: &str, source: DocumentSource) -> InferenceChunk {
        InferenceChunk {
            document_id: doc_id.to_string(),
            chunk_id: 0,
            content: "c".to_string(),
            source,
            semantic_identifier: doc_id.to_string(),
            link: None,
            metadata: HashMap::new(),
            doc_updated_at: None,
            large_chunk_reference_ids: Vec::new(),
            score: None,
        }
    }

    fn access(emails: &[&str], public: bool) -> ExternalAccess {
        ExternalAccess {
            external_user_emails: emails.iter().map(|e| e.to_string()).collect(),
            external_user_group_ids: BTreeSet::new(),
            is_public: public,
        }
    }

    #[tokio::test]
    async fn test_non_censored_sources_pass_through() {
        let lookup = StubLookup { map: HashMap::new() };
        let chunks = vec![chunk("web-doc", DocumentSource::Web)];
        let kept = censor_chunks(&lookup, "a@ex.com", &[], chunks).await;
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn test_salesforce_chunk_requires_matching_acl() {
        let lookup = StubLookup {
            map: HashMap::from([
                ("sf-mine".to_string(), access(&["a@ex.com"], false)),
                ("sf-other".to_string(), access(&["b@ex.com"], false)),
            ]),
        };
        let chunks = vec![
            chunk("sf-mine", DocumentSource::Salesforce),
            chunk("sf-other", DocumentSource::Salesforce),
            chunk("sf-unknown", DocumentSource::Salesforce),
        ];
        let kept = censor_chunks(&lookup, "a@ex.com", &[], chunks).await;
        let ids: Vec<_> = kept.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["sf-mine"]);
    }

    #[tokio::test]
    async fn test_group_membership_grants_access() {
        let lookup = StubLookup {
            map: HashMap::from([(
                "sf-doc".to_string(),
                ExternalAccess {
                    external_user_emails: BTreeSet::new(),
                    external_user_group_ids: BTreeSet::from(["sales".to_string()]),
                    is_public: false,
                },
            )]),
        };
        let chunks = vec![chunk("sf-doc", DocumentSource::Salesforce)];
        let kept = censor_chunks(
            &lookup,
            "a@ex.com",
            &["sales".to_string()],
            chunks,
        )
        .await;
        assert_eq!(kept.len(), 1);
    }
}
