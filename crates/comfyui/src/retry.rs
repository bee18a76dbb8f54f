//! Bounded retry policies for reaching a ComfyUI instance.
//!
//! A [`RetryPolicy`] describes how often and how many times an operation
//! is attempted. [`retry`] runs an operation under a policy, sleeping
//! between attempts through a [`Clock`] so tests can observe the delays
//! without waiting for them.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Source of delays between attempts.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait::async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Tunable parameters for a bounded retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure. `1.0` gives a
    /// fixed interval.
    pub multiplier: f64,
    /// Total attempts before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Retry every `interval`, at most `max_attempts` times.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            max_attempts,
        }
    }

    /// Poll the HTTP root once a second for up to three minutes.
    pub fn http_ready() -> Self {
        Self::fixed(Duration::from_secs(1), 180)
    }

    /// Try the WebSocket every five seconds for up to three minutes.
    pub fn ws_connect() -> Self {
        Self::fixed(Duration::from_secs(5), 36)
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Every attempt allowed by the policy failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts made.
    pub attempts: u32,
    /// Error from the final attempt, if any attempt was made.
    pub last_error: Option<E>,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_error {
            Some(e) => write!(f, "gave up after {} attempts: {e}", self.attempts),
            None => write!(f, "gave up after {} attempts", self.attempts),
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number. No delay follows the final
/// attempt.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    label: &str,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial_delay;
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match op(attempt).await {
            Ok(value) => {
                tracing::info!(target_name = label, attempt, "Connected");
                return Ok(value);
            }
            Err(e) => {
                tracing::debug!(
                    target_name = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Attempt failed",
                );
                last_error = Some(e);
            }
        }

        if attempt < policy.max_attempts {
            clock.sleep(delay).await;
            delay = next_delay(delay, policy);
        }
    }

    tracing::warn!(
        target_name = label,
        attempts = policy.max_attempts,
        "Retry attempts exhausted",
    );
    Err(RetryExhausted {
        attempts: policy.max_attempts,
        last_error,
    })
}
