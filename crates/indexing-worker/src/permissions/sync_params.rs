use search_shared::models::DocumentSource;

const DEFAULT_DOC_SYNC_FREQUENCY_SECS: i64 = 30 * 60;
const CONFLUENCE_DOC_SYNC_FREQUENCY_SECS: i64 = 60 * 60;
const GDRIVE_GROUP_SYNC_FREQUENCY_SECS: i64 = 5 * 60;
const CONFLUENCE_GROUP_SYNC_FREQUENCY_SECS: i64 = 60 * 60;
const SHAREPOINT_SYNC_FREQUENCY_SECS: i64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct DocSyncConfig {
    pub frequency_secs: i64,
    /// Whether the very first index of a pair should trigger a doc sync.
    pub initial_index_should_sync: bool,
}

#[derive(Debug, Clone)]
pub struct GroupSyncConfig {
    pub frequency_secs: i64,
    /// Some sources (Confluence) expose one global group directory; others
    /// scope groups per pair.
    pub is_pair_agnostic: bool,
}

/// Per-source sync behavior. None fields mean that dimension of sync does
/// not apply to the source.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub doc_sync: Option<DocSyncConfig>,
    pub group_sync: Option<GroupSyncConfig>,
    /// Post-query chunk censoring instead of (or in addition to) stored
    /// ACLs; evaluated by the answer server at retrieval time.
    pub chunk_censoring: bool,
}

/// Source-kind → sync behavior table.
pub fn sync_config_for(source: DocumentSource) -> Option<SyncConfig> {
    match source {
        DocumentSource::GoogleDrive => Some(SyncConfig {
            doc_sync: Some(DocSyncConfig {
                frequency_secs: DEFAULT_DOC_SYNC_FREQUENCY_SECS,
                initial_index_should_sync: true,
            }),
            group_sync: Some(GroupSyncConfig {
                frequency_secs: GDRIVE_GROUP_SYNC_FREQUENCY_SECS,
                is_pair_agnostic: false,
            }),
            chunk_censoring: false,
        }),
        DocumentSource::Confluence => Some(SyncConfig {
            doc_sync: Some(DocSyncConfig {
                frequency_secs: CONFLUENCE_DOC_SYNC_FREQUENCY_SECS,
                initial_index_should_sync: false,
            }),
            group_sync: Some(GroupSyncConfig {
                frequency_secs: CONFLUENCE_GROUP_SYNC_FREQUENCY_SECS,
                is_pair_agnostic: true,
            }),
            chunk_censoring: false,
        }),
        DocumentSource::Sharepoint => Some(SyncConfig {
            doc_sync: Some(DocSyncConfig {
                frequency_secs: SHAREPOINT_SYNC_FREQUENCY_SECS,
                initial_index_should_sync: true,
            }),
            group_sync: Some(GroupSyncConfig {
                frequency_secs: SHAREPOINT_SYNC_FREQUENCY_SECS,
                is_pair_agnostic: false,
            }),
            chunk_censoring: false,
        }),
        DocumentSource::Slack => Some(SyncConfig {
            // Channel access is all at the individual user level; no groups
            doc_sync: Some(DocSyncConfig {
                frequency_secs: DEFAULT_DOC_SYNC_FREQUENCY_SECS,
                initial_index_should_sync: true,
            }),
            group_sync: None,
            chunk_censoring: false,
        }),
        DocumentSource::Github => Some(SyncConfig {
            doc_sync: Some(DocSyncConfig {
                frequency_secs: DEFAULT_DOC_SYNC_FREQUENCY_SECS,
                initial_index_should_sync: true,
            }),
            group_sync: Some(GroupSyncConfig {
                frequency_secs: DEFAULT_DOC_SYNC_FREQUENCY_SECS,
                is_pair_agnostic: false,
            }),
            chunk_censoring: false,
        }),
        DocumentSource::Salesforce => Some(SyncConfig {
            doc_sync: None,
            group_sync: None,
            chunk_censoring: true,
        }),
        _ => None,
    }
}

/// A source participates in permission sync if any sync dimension applies.
pub fn is_valid_sync_source(source: DocumentSource) -> bool {
    sync_config_for(source).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gdrive_has_doc_and_group_sync() {
        let config = sync_config_for(DocumentSource::GoogleDrive).unwrap();
        assert!(config.doc_sync.is_some());
        let group = config.group_sync.unwrap();
        assert!(!group.is_pair_agnostic);
    }

    #[test]
    fn test_confluence_group_sync_is_global() {
        let config = sync_config_for(DocumentSource::Confluence).unwrap();
        assert!(config.group_sync.unwrap().is_pair_agnostic);
    }

    #[test]
    fn test_salesforce_uses_censoring_only() {
        let config = sync_config_for(DocumentSource::Salesforce).unwrap();
        assert!(config.doc_sync.is_none());
        assert!(config.group_sync.is_none());
        assert!(config.chunk_censoring);
    }

    #[test]
    fn test_web_is_not_a_sync_source() {
        assert!(!is_valid_sync_source(DocumentSource::Web));
    }
}
