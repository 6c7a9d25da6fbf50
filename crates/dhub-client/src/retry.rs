//! Retry Logic for Batch Writes
//!
//! Every write to a shard goes through [`send_with_retry`]. How a failure is
//! handled depends on its [`ErrorClass`]:
//!
//! ```text
//!            attempt 0 ──► put_records_by_shard
//!                              │
//!          ┌──────────┬────────┼───────────┬──────────────┐
//!          ▼          ▼        ▼           ▼              ▼
//!        Fatal   ShardSealed  Network   Retryable    RateLimited
//!          │          │        │           │              │
//!       give up   hand back   sleep retry_interval     sleep 100ms
//!                 to caller    └─────┬─────┘              │
//!                                    ▼                    │
//!                           attempt < max_retry? ◄────────┘
//! ```
//!
//! `max_retry` counts retries after the first attempt, so a bounded policy
//! makes at most `max_retry + 1` calls. A negative `max_retry` never gives up.
//! Shard-sealed errors are returned on the spot: the caller refreshes topology
//! and resubmits the batch elsewhere instead of retrying the same shard.
//!
//! ## Examples
//!
//! ```ignore
//! use dhub_client::retry::{send_with_retry, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(500));
//! let result = send_with_retry(&policy, || async {
//!     transport.put_records_by_shard(project, topic, "0", frame.clone(), count).await
//! }).await?;
//! ```

use crate::error::{ErrorClass, TransportError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fixed wait after a rate-limit response.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(100);

/// Retry settings for shard writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Negative means unbounded.
    pub max_retry: i32,

    /// Wait between attempts after network and transient service errors.
    pub retry_interval: Duration,

    /// Wait after a rate-limit response.
    pub rate_limit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_interval: Duration::from_millis(500),
            rate_limit_backoff: RATE_LIMIT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry: i32, retry_interval: Duration) -> Self {
        Self {
            max_retry,
            retry_interval,
            rate_limit_backoff: RATE_LIMIT_BACKOFF,
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (0-based).
    pub fn has_retries_left(&self, attempt: u32) -> bool {
        self.max_retry < 0 || attempt < self.max_retry as u32
    }

    /// Wait before retrying an error of class `class`, or `None` when the
    /// class is never retried against the same shard.
    pub fn delay_for(&self, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::Retryable | ErrorClass::Network => Some(self.retry_interval),
            ErrorClass::RateLimited => Some(self.rate_limit_backoff),
            ErrorClass::Fatal | ErrorClass::ShardSealed => None,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries. The last error is returned.
pub async fn send_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransportError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Write succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                let class = error.class();
                let Some(delay) = policy.delay_for(class) else {
                    if class == ErrorClass::ShardSealed {
                        debug!(error = %error, "Shard sealed, handing batch back");
                    } else {
                        warn!(kind = ?error.kind, error = %error, "Non-retryable error, giving up");
                    }
                    return Err(error);
                };

                if !policy.has_retries_left(attempt) {
                    warn!(
                        attempt = attempt + 1,
                        max_retry = policy.max_retry,
                        kind = ?error.kind,
                        error = %error,
                        "Max retries exhausted, giving up"
                    );
                    return Err(error);
                }

                warn!(
                    attempt = attempt + 1,
                    max_retry = policy.max_retry,
                    backoff_ms = delay.as_millis() as u64,
                    kind = ?error.kind,
                    "Retryable error, backing off"
                );
                sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Scale `base` by a random factor in `[1 - fraction, 1 + fraction]`.
pub fn jittered(base: Duration, fraction: f64) -> Duration {
    let fraction = fraction.clamp(0.0, 1.0);
    let factor = 1.0 - fraction + rand::random::<f64>() * 2.0 * fraction;
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}
