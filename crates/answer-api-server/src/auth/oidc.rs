use std::collections::HashMap;

use anyhow::{anyhow, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::{
    AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken, EndpointNotSet,
    EndpointSet, ExtraTokenFields, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::settings::OidcConfig;

/// OIDC providers return the identity token alongside the OAuth2 fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenExtraFields {
    #[serde(default)]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenExtraFields {}

type OidcTokenResponse = StandardTokenResponse<IdTokenExtraFields, BasicTokenType>;

type ConfiguredClient = Client<
    BasicErrorResponse,
    OidcTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: usize,
}

#[derive(Debug, Clone)]
pub struct OidcTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: Option<i64>,
    pub claims: Option<IdTokenClaims>,
}

/// Claims from an id_token handed to us directly by the token endpoint over
/// TLS; only the identity fields are needed here, so the signature is not
/// re-verified against the provider's JWKS.
pub fn decode_id_token_claims(id_token: &str) -> Result<IdTokenClaims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::HS256];
    validation.insecure_disable_signature_validation();
    validation.validate_aud = false;

    let data =
        jsonwebtoken::decode::<IdTokenClaims>(id_token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

/// Encode the post-login redirect into the state as `nonce|next_url` so the
/// callback can restore where the user was headed.
fn encode_state(nonce: &str, next_url: &str) -> String {
    format!("{nonce}|{next_url}")
}

/// Split a state back into (nonce, next_url). The next_url may itself
/// contain `|`, so only the first separator counts.
pub fn decode_state(state: &str) -> Option<(&str, &str)> {
    state.split_once('|')
}

/// OIDC authorization-code bridge with PKCE. Token exchange goes through
/// one shared HTTP client; retries are bounded with a short fixed sleep.
pub struct OidcBridge {
    client: ConfiguredClient,
    http: reqwest::Client,
    /// PKCE verifiers keyed by the state nonce, consumed at the callback.
    pending_verifiers: Mutex<HashMap<String, String>>,
    max_retries: u32,
}

impl OidcBridge {
    pub fn new(config: OidcConfig) -> Result<Self> {
        let client: ConfiguredClient = Client::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(config.authorize_url.clone())?)
            .set_token_uri(TokenUrl::new(config.token_url.clone())?)
            .set_redirect_uri(RedirectUrl::new(config.redirect_uri.clone())?);

        // Token endpoints must not be followed through redirects
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();

        Ok(Self {
            client,
            http,
            pending_verifiers: Mutex::new(HashMap::new()),
            max_retries: 3,
        })
    }

    /// Authorization URL with a PKCE challenge; the verifier is held until
    /// the matching callback arrives.
    pub async fn authorization_url(&self, next_url: &str) -> String {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let nonce = CsrfToken::new_random();
        let state = encode_state(nonce.secret(), next_url);

        let (auth_url, _csrf) = self
            .client
            .authorize_url(|| CsrfToken::new(state))
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("offline_access".to_string()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        self.pending_verifiers
            .lock()
            .await
            .insert(nonce.secret().clone(), pkce_verifier.secret().to_string());

        auth_url.to_string()
    }

    /// Exchange the authorization code with its stored PKCE verifier;
    /// returns the tokens plus the next URL recovered from the state.
    pub async fn exchange_code(&self, code: &str, state: &str) -> Result<(OidcTokens, String)> {
        let (nonce, next_url) =
            decode_state(state).ok_or_else(|| anyhow!("malformed OIDC state"))?;
        let verifier = self
            .pending_verifiers
            .lock()
            .await
            .remove(nonce)
            .ok_or_else(|| anyhow!("unknown or replayed OIDC state"))?;

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            let request = self
                .client
                .exchange_code(AuthorizationCode::new(code.to_string()))
                .set_pkce_verifier(PkceCodeVerifier::new(verifier.clone()));
            match request.request_async(&self.http).await {
                Ok(response) => return Ok((to_tokens(response), next_url.to_string())),
                Err(e) => last_error = Some(anyhow!("token exchange failed: {e}")),
            }
            debug!(
                "Token exchange attempt {}/{} failed, retrying",
                attempt + 1,
                self.max_retries
            );
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Err(last_error.unwrap_or_else(|| anyhow!("token exchange failed")))
    }

    /// App-level client-credentials token for admin-scoped Graph calls, so
    /// per-user delegated tokens cannot expire mid-sync.
    pub async fn app_token(&self, scope: &str) -> Result<OidcTokens> {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            let request = self
                .client
                .exchange_client_credentials()
                .add_scope(Scope::new(scope.to_string()));
            match request.request_async(&self.http).await {
                Ok(response) => return Ok(to_tokens(response)),
                Err(e) => last_error = Some(anyhow!("client credentials grant failed: {e}")),
            }
            debug!(
                "App token attempt {}/{} failed, retrying",
                attempt + 1,
                self.max_retries
            );
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Err(last_error.unwrap_or_else(|| anyhow!("client credentials grant failed")))
    }
}

fn to_tokens(response: OidcTokenResponse) -> OidcTokens {
    let id_token = response.extra_fields().id_token.clone();
    let claims = id_token.as_deref().and_then(|token| {
        decode_id_token_claims(token)
            .map_err(|e| warn!("Could not decode id_token claims: {}", e))
            .ok()
    });

    OidcTokens {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        id_token,
        expires_in: response.expires_in().map(|d| d.as_secs() as i64),
        claims,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // 2100-01-01, far enough out that exp validation always passes
    const TEST_EXP: usize = 4_102_444_800;

    fn test_config() -> OidcConfig {
        OidcConfig {
            authorize_url: "https://login.example.com/oauth2/authorize".to_string(),
            token_url: "https://login.example.com/oauth2/token".to_string(),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            graph_base_url: "https://graph.example.com".to_string(),
            tenant_id: "tenant".to_string(),
        }
    }

    fn test_id_token() -> String {
        let claims = IdTokenClaims {
            sub: "user-1".to_string(),
            email: Some("a@ex.com".to_string()),
            preferred_username: None,
            name: Some("Ada".to_string()),
            exp: TEST_EXP,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"test-only"),
        )
        .unwrap()
    }

    #[test]
    fn test_state_roundtrip_keeps_separators_in_next_url() {
        let state = encode_state("nonce123", "https://app/x|y");
        let (nonce, next) = decode_state(&state).unwrap();
        assert_eq!(nonce, "nonce123");
        assert_eq!(next, "https://app/x|y");
    }

    #[test]
    fn test_decode_id_token_claims() {
        let claims = decode_id_token_claims(&test_id_token()).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("a@ex.com"));
        assert_eq!(claims.name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn test_authorization_url_carries_pkce_and_state() {
        let bridge = OidcBridge::new(test_config()).unwrap();
        let url = bridge.authorization_url("https://app.example.com/chat").await;

        assert!(url.starts_with("https://login.example.com/oauth2/authorize?"));
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state="));
        // The verifier waits for the callback
        assert_eq!(bridge.pending_verifiers.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exchange_rejects_unknown_state() {
        let bridge = OidcBridge::new(test_config()).unwrap();
        let err = bridge
            .exchange_code("code", "never-issued|https://app/next")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[tokio::test]
    async fn test_exchange_code_returns_tokens_and_claims() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "token_type": "bearer",
                "refresh_token": "rt-1",
                "expires_in": 3600,
                "id_token": test_id_token(),
            })))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.token_url = format!("{}/token", server.uri());
        let bridge = OidcBridge::new(config).unwrap();

        let _ = bridge.authorization_url("https://app/next").await;
        let nonce = bridge
            .pending_verifiers
            .lock()
            .await
            .keys()
            .next()
            .unwrap()
            .clone();
        let state = encode_state(&nonce, "https://app/next");

        let (tokens, next_url) = bridge.exchange_code("auth-code", &state).await.unwrap();
        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(next_url, "https://app/next");
        assert_eq!(tokens.claims.unwrap().email.as_deref(), Some("a@ex.com"));

        // The verifier is single-use
        let err = bridge.exchange_code("auth-code", &state).await.unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }
}
