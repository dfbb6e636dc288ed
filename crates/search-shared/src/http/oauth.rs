use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct TokenState {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// Refreshable OAuth credential. Refresh is single-flight per credential:
/// concurrent callers queue on the internal mutex and the winner's token is
/// reused by everyone behind it.
pub struct OAuthSession {
    pub credential_id: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    state: Mutex<TokenState>,
}

impl OAuthSession {
    pub fn new(
        credential_id: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            credential_id: credential_id.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            state: Mutex::new(TokenState {
                access_token: access_token.into(),
                refresh_token,
                expires_at,
            }),
        }
    }

    pub fn can_refresh(&self) -> bool {
        // Lock is cheap here and avoids exposing the state type
        match self.state.try_lock() {
            Ok(state) => state.refresh_token.is_some(),
            Err(_) => true,
        }
    }

    /// Current bearer token, refreshing first if it is known to be expired.
    pub async fn bearer(&self, http: &reqwest::Client) -> Result<String> {
        let mut state = self.state.lock().await;
        let expired = state
            .expires_at
            .map(|at| at <= Utc::now() + Duration::seconds(30))
            .unwrap_or(false);
        if expired && state.refresh_token.is_some() {
            debug!(
                "Access token expired for credential {}, refreshing",
                self.credential_id
            );
            Self::refresh_locked(&mut state, http, &self.token_url, &self.client_id, &self.client_secret)
                .await?;
        }
        Ok(state.access_token.clone())
    }

    /// Refresh regardless of expiry, used after the server returned 401.
    /// Returns the token that should be retried with. If another caller
    /// already refreshed while we waited for the lock, that token is reused.
    pub async fn refresh_after_unauthorized(
        &self,
        http: &reqwest::Client,
        rejected_token: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.access_token != rejected_token {
            // Someone else refreshed while we waited
            return Ok(state.access_token.clone());
        }
        if state.refresh_token.is_none() {
            return Err(anyhow!(
                "credential {} has no refresh_token",
                self.credential_id
            ));
        }
        info!("Refreshing OAuth token for credential {}", self.credential_id);
        Self::refresh_locked(&mut state, http, &self.token_url, &self.client_id, &self.client_secret)
            .await?;
        Ok(state.access_token.clone())
    }

    async fn refresh_locked(
        state: &mut TokenState,
        http: &reqwest::Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<()> {
        let refresh_token = state
            .refresh_token
            .clone()
            .ok_or_else(|| anyhow!("no refresh_token available"))?;

        let client = BasicClient::new(ClientId::new(client_id.to_string()))
            .set_client_secret(ClientSecret::new(client_secret.to_string()))
            .set_token_uri(TokenUrl::new(token_url.to_string())?);

        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .request_async(http)
            .await
            .map_err(|e| anyhow!("token refresh failed: {e}"))?;

        state.access_token = response.access_token().secret().clone();
        if let Some(new_refresh) = response.refresh_token() {
            state.refresh_token = Some(new_refresh.secret().clone());
        }
        state.expires_at = response
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(token_url: &str) -> OAuthSession {
        OAuthSession::new(
            "cred-1",
            token_url,
            "client-id",
            "client-secret",
            "stale-token",
            Some("refresh-1".to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn test_refresh_after_unauthorized_swaps_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "token_type": "bearer",
                "refresh_token": "refresh-2",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = session(&format!("{}/token", server.uri()));
        let http = reqwest::Client::new();

        let token = session
            .refresh_after_unauthorized(&http, "stale-token")
            .await
            .unwrap();
        assert_eq!(token, "fresh-token");

        // A caller still holding the stale token reuses the refreshed one
        // instead of hitting the endpoint again
        let token = session
            .refresh_after_unauthorized(&http, "stale-token")
            .await
            .unwrap();
        assert_eq!(token, "fresh-token");
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails() {
        let session = OAuthSession::new(
            "cred-2",
            "https://login.example.com/token",
            "client-id",
            "client-secret",
            "token",
            None,
            None,
        );
        let http = reqwest::Client::new();
        assert!(session
            .refresh_after_unauthorized(&http, "token")
            .await
            .is_err());
    }
}
