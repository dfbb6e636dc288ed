use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Permissions pulled from the source of truth for a single document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccess {
    pub external_user_emails: BTreeSet<String>,
    pub external_user_group_ids: BTreeSet<String>,
    pub is_public: bool,
}

impl ExternalAccess {
    pub fn public() -> Self {
        Self {
            external_user_emails: BTreeSet::new(),
            external_user_group_ids: BTreeSet::new(),
            is_public: true,
        }
    }
}

/// Immutable snapshot tying a document id to its external ACL; latest wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocExternalAccess {
    pub doc_id: String,
    pub external_access: ExternalAccess,
}

/// Full access picture for a document at index time, combining in-platform
/// users/groups with the external snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAccess {
    pub user_emails: BTreeSet<String>,
    pub user_groups: BTreeSet<String>,
    pub external_user_emails: BTreeSet<String>,
    pub external_user_group_ids: BTreeSet<String>,
    pub is_public: bool,
}

const PUBLIC_TOKEN: &str = "PUBLIC";
const USER_PREFIX: &str = "user_email:";
const GROUP_PREFIX: &str = "group:";
const EXTERNAL_USER_PREFIX: &str = "external_user_email:";
const EXTERNAL_GROUP_PREFIX: &str = "external_group:";

impl DocumentAccess {
    pub fn build(
        user_emails: Vec<String>,
        user_groups: Vec<String>,
        external_user_emails: Vec<String>,
        external_user_group_ids: Vec<String>,
        is_public: bool,
    ) -> Self {
        Self {
            user_emails: user_emails.into_iter().collect(),
            user_groups: user_groups.into_iter().collect(),
            external_user_emails: external_user_emails.into_iter().collect(),
            external_user_group_ids: external_user_group_ids.into_iter().collect(),
            is_public,
        }
    }

    pub fn from_external(external: &ExternalAccess) -> Self {
        Self {
            user_emails: BTreeSet::new(),
            user_groups: BTreeSet::new(),
            external_user_emails: external.external_user_emails.clone(),
            external_user_group_ids: external.external_user_group_ids.clone(),
            is_public: external.is_public,
        }
    }

    /// Flattened ACL entries as stored on each chunk in the index. Retrieval
    /// filters are expressed in the same token format.
    pub fn to_acl(&self) -> Vec<String> {
        let mut acl = Vec::new();
        if self.is_public {
            acl.push(PUBLIC_TOKEN.to_string());
        }
        acl.extend(self.user_emails.iter().map(|e| format!("{USER_PREFIX}{e}")));
        acl.extend(self.user_groups.iter().map(|g| format!("{GROUP_PREFIX}{g}")));
        acl.extend(
            self.external_user_emails
                .iter()
                .map(|e| format!("{EXTERNAL_USER_PREFIX}{e}")),
        );
        acl.extend(
            self.external_user_group_ids
                .iter()
                .map(|g| format!("{EXTERNAL_GROUP_PREFIX}{g}")),
        );
        acl
    }

    /// ACL tokens a given user may match on, for building retrieval filters.
    pub fn acl_for_user(email: &str, group_ids: &[String]) -> Vec<String> {
        let mut acl = vec![
            PUBLIC_TOKEN.to_string(),
            format!("{USER_PREFIX}{email}"),
            format!("{EXTERNAL_USER_PREFIX}{email}"),
        ];
        for group in group_ids {
            acl.push(format!("{GROUP_PREFIX}{group}"));
            acl.push(format!("{EXTERNAL_GROUP_PREFIX}{group}"));
        }
        acl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_includes_public_token() {
        let access = DocumentAccess::build(
            vec!["a@ex.com".to_string()],
            vec![],
            vec![],
            vec!["folder_1".to_string()],
            true,
        );
        let acl = access.to_acl();
        assert!(acl.contains(&"PUBLIC".to_string()));
        assert!(acl.contains(&"user_email:a@ex.com".to_string()));
        assert!(acl.contains(&"external_group:folder_1".to_string()));
    }

    #[test]
    fn test_user_acl_matches_document_acl() {
        let doc = DocumentAccess::build(
            vec![],
            vec![],
            vec!["a@ex.com".to_string()],
            vec![],
            false,
        );
        let user = DocumentAccess::acl_for_user("a@ex.com", &[]);
        assert!(doc.to_acl().iter().any(|token| user.contains(token)));
    }

    #[test]
    fn test_same_input_builds_same_access() {
        let build = || {
            DocumentAccess::build(
                vec!["b@ex.com".to_string(), "a@ex.com".to_string()],
                vec!["eng".to_string()],
                vec![],
                vec![],
                false,
            )
        };
        assert_eq!(build(), build());
    }
}
