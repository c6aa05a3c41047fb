//! Bounded retry with jittered exponential backoff.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use kide_core::SyncError;
use metrics::counter;
use tracing::warn;

/// Retry bounds for one API call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single request.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts: `max_attempts - 1` jittered values, capped at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_jitter()
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .build()
    }
}

/// Unbounded, capped, jittered backoff for reconnect loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { min_delay: Duration::from_millis(500), max_delay: Duration::from_secs(30) }
    }
}

impl BackoffPolicy {
    pub fn start(&self) -> Backoff {
        Backoff { policy: *self, inner: self.fresh(), attempt: 0 }
    }

    fn fresh(&self) -> backon::ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_jitter()
            .with_max_times(usize::MAX)
            .build()
    }
}

/// Running backoff state; `reset` after a successful connect.
pub struct Backoff {
    policy: BackoffPolicy,
    inner: backon::ExponentialBackoff,
    attempt: u32,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff").field("policy", &self.policy).field("attempt", &self.attempt).finish()
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.inner.next().unwrap_or(self.policy.max_delay)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.inner = self.policy.fresh();
        self.attempt = 0;
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or runs out
/// of attempts. Exhaustion reports the attempt count in the error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut delays = policy.delays();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(SyncError::TransientFetch { message, .. }) => match delays.next() {
                Some(delay) => {
                    counter!("kide_api_retries_total", 1, "op" => op.to_string());
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %message, "retrying after transient error");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(op, attempt, error = %message, "retry attempts exhausted");
                    return Err(SyncError::TransientFetch { attempts: attempt, message });
                }
            },
            Err(e) => return Err(e),
        }
    }
}
