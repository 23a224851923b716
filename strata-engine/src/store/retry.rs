//! Retry / timeout helpers wrapped explicitly around store calls

use super::{StoreError, StoreResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Per-attempt timeout
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
            attempt_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the retry budget is
/// spent. The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        let result = match policy.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, op())
                .await
                .unwrap_or(Err(StoreError::Timeout(limit))),
            None => op().await,
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", what, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    what,
                    attempt + 1,
                    policy.total_attempts(),
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
