//! Bounded retry with exponential backoff for marketplace calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::error::{ApiRetryClass, MarketplaceError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// When false only rate limits are retried (the request was never processed).
    pub retry_transient: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            retry_transient: true,
        }
    }

    /// Policy for non-idempotent calls such as refresh-token exchanges.
    pub fn rate_limits_only(&self) -> Self {
        Self {
            retry_transient: false,
            ..self.clone()
        }
    }

    /// Delay before the next attempt, or `None` when the error must surface.
    pub fn delay_for(&self, err: &MarketplaceError, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries || err.retry_class() != ApiRetryClass::Retryable {
            return None;
        }
        let backoff = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1).min(6)))
            .min(self.max_delay);
        match err {
            MarketplaceError::RateLimited { retry_after } => {
                Some(retry_after.map_or(backoff, |d| d.min(self.max_delay)))
            }
            MarketplaceError::Transient(_) if self.retry_transient => Some(backoff),
            _ => None,
        }
    }
}

pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, MarketplaceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MarketplaceError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                match policy.delay_for(&err, attempt) {
                    Some(delay) => {
                        warn!(
                            operation,
                            attempt,
                            error = %err,
                            "Marketplace call failed; retrying after {}ms",
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}
