//! Retry discipline shared by connection managers, the persist queue and accessors.
//!
//! Only failures classified as retryable (refused, timed out, closed) consume retry
//! budget. Anything else is returned to the caller on the first occurrence.
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Failure classification used by every retry loop in the crate.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff: `min(base * 2^attempt, cap)`, at most `max_attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay to wait before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the attempt
/// budget is spent. The last error is returned on exhaustion.
pub async fn retry<T, E, F, Fut>(policy: &Backoff, op_name: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                debug!(op = op_name, error = %e, "non-retryable failure");
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    warn!(op = op_name, attempts = attempt, error = %e, "retries exhausted");
                    return Err(e);
                }

                let delay = policy.delay(attempt - 1);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Same as [`retry`], but on exhaustion returns `fallback()` instead of the error.
///
/// Non-retryable errors still propagate so callers can tell bad input apart from
/// an unavailable dependency.
pub async fn retry_or_else<T, E, F, Fut, G>(
    policy: &Backoff,
    op_name: &str,
    op: F,
    fallback: G,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
    G: FnOnce() -> T,
{
    match retry(policy, op_name, op).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => {
            warn!(op = op_name, error = %e, "using fallback after exhausted retries");
            Ok(fallback())
        }
        Err(e) => Err(e),
    }
}
