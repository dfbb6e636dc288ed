use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use super::oauth::OAuthSession;

#[derive(Error, Debug)]
pub enum HttpPoolError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limited and retries exhausted for {url}")]
    RetriesExhausted { url: String, last_status: u16 },

    #[error("Non-retryable response {status} from {url}: {body}")]
    FailedFast {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Auth refresh failed: {0}")]
    AuthRefresh(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// How a request authenticates against its upstream.
#[derive(Clone, Default)]
pub enum RequestAuth {
    #[default]
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
    /// Refreshable OAuth; a 401 triggers a single-flight refresh + one retry.
    OAuth(Arc<OAuthSession>),
}

#[derive(Debug, Clone)]
pub struct HttpPoolConfig {
    pub requests_per_second_per_host: u32,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            requests_per_second_per_host: 10,
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2,
            max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Shared HTTP client with per-host token buckets and uniform retry
/// behavior for the connector and tool runtimes.
pub struct RateLimitedClient {
    client: reqwest::Client,
    config: HttpPoolConfig,
    host_limiters: DashMap<String, Arc<DefaultDirectRateLimiter>>,
}

impl RateLimitedClient {
    pub fn new(config: HttpPoolConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            host_limiters: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    fn limiter_for_host(&self, host: &str) -> Arc<DefaultDirectRateLimiter> {
        self.host_limiters
            .entry(host.to_string())
            .or_insert_with(|| {
                let per_second = NonZeroU32::new(self.config.requests_per_second_per_host.max(1))
                    .unwrap_or(NonZeroU32::MIN);
                Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
            })
            .clone()
    }

    pub async fn get(&self, url: &str, auth: &RequestAuth) -> Result<Response, HttpPoolError> {
        self.request(Method::GET, url, HeaderMap::new(), None, auth)
            .await
    }

    pub async fn get_json(
        &self,
        url: &str,
        auth: &RequestAuth,
    ) -> Result<serde_json::Value, HttpPoolError> {
        let response = self.get(url, auth).await?;
        Ok(response.json().await?)
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        auth: &RequestAuth,
    ) -> Result<Response, HttpPoolError> {
        self.request(Method::POST, url, HeaderMap::new(), Some(body.clone()), auth)
            .await
    }

    /// Core entry point: rate-limit by host, retry with exponential backoff
    /// on 429/5xx (and 403 when it carries quota markers), fail fast on
    /// other 4xx, refresh + retry once on 401 for OAuth credentials.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<serde_json::Value>,
        auth: &RequestAuth,
    ) -> Result<Response, HttpPoolError> {
        let parsed =
            url::Url::parse(url).map_err(|e| HttpPoolError::Invalid(format!("{url}: {e}")))?;
        let host = parsed.host_str().unwrap_or("unknown").to_string();
        let limiter = self.limiter_for_host(&host);

        let mut refreshed_once = false;
        let mut last_status: u16 = 0;

        for attempt in 0..self.config.max_retries {
            limiter.until_ready().await;

            let mut used_token: Option<String> = None;
            let mut request = self.client.request(method.clone(), url).headers(headers.clone());
            request = match auth {
                RequestAuth::None => request,
                RequestAuth::Bearer(token) => request.bearer_auth(token),
                RequestAuth::Basic { username, password } => {
                    request.basic_auth(username, Some(password))
                }
                RequestAuth::OAuth(session) => {
                    let token = session
                        .bearer(&self.client)
                        .await
                        .map_err(|e| HttpPoolError::AuthRefresh(e.to_string()))?;
                    used_token = Some(token.clone());
                    request.bearer_auth(token)
                }
            };
            if let Some(ref json) = body {
                request = request.json(json);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    // Transport errors are retried on the same schedule
                    last_status = 0;
                    warn!("Request to {} failed: {} (attempt {})", url, e, attempt + 1);
                    tokio::time::sleep(self.retry_delay(attempt, None)).await;
                    continue;
                }
            };

            let status = response.status();
            last_status = status.as_u16();

            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed_once {
                if let RequestAuth::OAuth(session) = auth {
                    if session.can_refresh() {
                        let rejected = used_token.unwrap_or_default();
                        session
                            .refresh_after_unauthorized(&self.client, &rejected)
                            .await
                            .map_err(|e| HttpPoolError::AuthRefresh(e.to_string()))?;
                        refreshed_once = true;
                        continue;
                    }
                }
            }

            let retry_after = parse_retry_after(response.headers());

            if self.is_retryable(status, retry_after.is_some(), &response).await {
                let delay = self.retry_delay(attempt, retry_after);
                debug!(
                    "Retryable status {} from {}, sleeping {:?} (attempt {}/{})",
                    status,
                    url,
                    delay,
                    attempt + 1,
                    self.config.max_retries
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let body_text = response.text().await.unwrap_or_default();
            return Err(HttpPoolError::FailedFast {
                url: url.to_string(),
                status: status.as_u16(),
                body: truncate(&body_text, 500),
            });
        }

        Err(HttpPoolError::RetriesExhausted {
            url: url.to_string(),
            last_status,
        })
    }

    async fn is_retryable(
        &self,
        status: StatusCode,
        has_retry_after: bool,
        _response: &Response,
    ) -> bool {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return true;
        }
        // Some sources report quota exhaustion as 403 with a Retry-After
        status == StatusCode::FORBIDDEN && has_retry_after
    }

    fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(after) = retry_after {
            if after > self.config.max_delay {
                warn!(
                    "Retry-After of {}s exceeds cap, clamping to {}s",
                    after.as_secs(),
                    self.config.max_delay.as_secs()
                );
                return self.config.max_delay;
            }
            return after;
        }

        let factor = self.config.backoff_factor.pow(attempt);
        let delay = self.config.base_delay.saturating_mul(factor);
        delay.min(self.config.max_delay)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> RateLimitedClient {
        RateLimitedClient::new(HttpPoolConfig::default())
    }

    #[test]
    fn test_retry_after_clamped_to_cap() {
        let client = test_client();
        let delay = client.retry_delay(0, Some(Duration::from_secs(9999)));
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_schedule() {
        let client = test_client();
        assert_eq!(client.retry_delay(0, None), Duration::from_secs(2));
        assert_eq!(client.retry_delay(1, None), Duration::from_secs(4));
        assert_eq!(client.retry_delay(2, None), Duration::from_secs(8));
        // capped
        assert_eq!(client.retry_delay(10, None), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_after_respected_when_below_cap() {
        let client = test_client();
        let delay = client.retry_delay(3, Some(Duration::from_secs(7)));
        assert_eq!(delay, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_fails_fast_on_bad_request() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client();
        let result = client.get(&server.uri(), &RequestAuth::None).await;
        match result {
            Err(HttpPoolError::FailedFast { status, .. }) => assert_eq!(status, 400),
            other => panic!("expected FailedFast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retries_on_server_error_then_succeeds() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut config = HttpPoolConfig::default();
        config.base_delay = Duration::from_millis(10);
        let client = RateLimitedClient::new(config);

        let response = client.get(&server.uri(), &RequestAuth::None).await.unwrap();
        assert_eq!(response.status(), 200);
    }
}
