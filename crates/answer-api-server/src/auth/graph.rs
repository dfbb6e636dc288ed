use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::debug;

use super::oidc::OidcBridge;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryGroup {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryMember {
    mail: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
}

/// Admin-scoped Graph lookups used for policy evaluation: which groups
/// exist and who is in them. All calls use the app token so user-delegated
/// tokens never expire mid-enumeration.
pub struct GraphClient {
    client: reqwest::Client,
    oidc: OidcBridge,
    base_url: String,
}

impl GraphClient {
    pub fn new(oidc: OidcBridge, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            oidc,
            base_url: base_url.into(),
        }
    }

    async fn get_paged<T: serde::de::DeserializeOwned>(&self, first_url: String) -> Result<Vec<T>> {
        let token = self.oidc.app_token(GRAPH_SCOPE).await?;
        let mut url = Some(first_url);
        let mut all = Vec::new();

        while let Some(current) = url.take() {
            let response = self
                .client
                .get(&current)
                .bearer_auth(&token.access_token)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(anyhow!("Graph returned {}", response.status()));
            }
            let page: GraphPage<T> = response.json().await?;
            all.extend(page.value);
            url = page.next_link;
        }
        Ok(all)
    }

    pub async fn list_groups(&self) -> Result<Vec<DirectoryGroup>> {
        let groups = self
            .get_paged(format!("{}/v1.0/groups?$select=id,displayName", self.base_url))
            .await?;
        debug!("Enumerated {} directory groups", groups.len());
        Ok(groups)
    }

    pub async fn group_member_emails(&self, group_id: &str) -> Result<Vec<String>> {
        let members: Vec<DirectoryMember> = self
            .get_paged(format!(
                "{}/v1.0/groups/{}/members?$select=mail,userPrincipalName",
                self.base_url, group_id
            ))
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|m| m.mail.or(m.user_principal_name))
            .collect())
    }

    /// Group ids a user belongs to, for building retrieval ACL filters.
    pub async fn user_group_ids(&self, user_email: &str) -> Result<Vec<String>> {
        let groups: Vec<DirectoryGroup> = self
            .get_paged(format!(
                "{}/v1.0/users/{}/memberOf?$select=id,displayName",
                self.base_url, user_email
            ))
            .await?;
        Ok(groups.into_iter().map(|g| g.id).collect())
    }
}
