use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::types::LlmError;

pub const DEFAULT_LLM_CONCURRENCY: usize = 8;

/// Process-wide cap on in-flight LLM calls. Every call into the provider
/// goes through one of these permits.
#[derive(Clone)]
pub struct LlmLimiter {
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl LlmLimiter {
    pub fn new(concurrency: usize, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            acquire_timeout,
        }
    }

    pub async fn acquire(&self, op: &'static str) -> Result<OwnedSemaphorePermit, LlmError> {
        let start = Instant::now();
        let permit = tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| LlmError::Api(format!("limiter acquire timeout for op={op}")))?
            .map_err(|_| LlmError::Api("limiter closed".to_string()))?;
        debug!(
            wait_ms = start.elapsed().as_millis() as u64,
            op, "llm_limiter_acquired"
        );
        Ok(permit)
    }
}

impl Default for LlmLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LLM_CONCURRENCY, Duration::from_secs(120))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.pow(attempt);
        let mut delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter {
            // Up to 25% extra to spread synchronized retries
            let jitter_ms = rand::rng().random_range(0..=(delay.as_millis() as u64 / 4).max(1));
            delay += Duration::from_millis(jitter_ms);
        }
        delay
    }
}

/// Run an LLM call, retrying with exponential backoff on rate limits.
/// Other errors are returned immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    op_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_error = None;
    for attempt in 0..=policy.max_retries {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_rate_limit() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{} rate limited, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| LlmError::Api(format!("{op_name} retries exhausted"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retries_only_on_rate_limit() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };

        let calls = AtomicU32::new(0);
        let result: Result<(), LlmError> = retry_with_backoff("test", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Api("boom".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let result: Result<u32, LlmError> = retry_with_backoff("test", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::RateLimited("slow down".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
