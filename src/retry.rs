//! Retry, reconnect and timeout utilities.
//!
//! `RetryPolicy` bounds request retries for the REST client, while
//! `ReconnectPolicy` schedules the realtime worker's reconnect attempts, which
//! are never capped in count.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Delay between realtime reconnect attempts unless configured otherwise.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns a short policy suited to interactive dashboard requests.
    pub fn interactive() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            jitter: Duration::from_millis(50),
        }
    }

    /// Returns a policy that performs exactly one attempt.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        exponential_delay(self.initial_backoff, self.max_backoff, attempt)
            + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Schedule used by the realtime client between a disconnect and the next
/// connection attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Wait the same delay before every attempt.
    Fixed(Duration),
    /// Double the delay after every consecutive failure, up to `max`.
    ///
    /// The sequence restarts at `initial` once a connection opens.
    Backoff {
        /// Delay before the first reconnect attempt.
        initial: Duration,
        /// Upper bound for the delay.
        max: Duration,
    },
}

impl ReconnectPolicy {
    /// Fixed delay of [`DEFAULT_RECONNECT_DELAY`].
    pub fn fixed() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_DELAY)
    }

    /// Delay before reconnect attempt `attempt` (1-based, counted since the
    /// last successful open).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Backoff { initial, max } => exponential_delay(*initial, *max, attempt),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn exponential_delay(initial: Duration, max: Duration, attempt: usize) -> Duration {
    let mut delay = initial.min(max);
    for _ in 1..attempt {
        delay = std::cmp::min(delay.saturating_mul(2), max);
    }
    delay
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{retry_async, ReconnectPolicy, RetryPolicy, DEFAULT_RECONNECT_DELAY};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn retries_until_success() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));

            let result = retry_async(
                &fast_policy(3),
                {
                    let calls = Arc::clone(&calls);
                    move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            let value = calls.fetch_add(1, Ordering::SeqCst);
                            if value < 2 {
                                Err("retry")
                            } else {
                                Ok("ok")
                            }
                        }
                    }
                },
                |_| true,
            )
            .await;

            assert_eq!(result.expect("success"), "ok");
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn stops_when_retry_predicate_rejects() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));

            let result: Result<(), &str> = retry_async(
                &fast_policy(5),
                {
                    let calls = Arc::clone(&calls);
                    move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err("fatal")
                        }
                    }
                },
                |_| false,
            )
            .await;

            assert_eq!(result.expect_err("expected failure"), "fatal");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let result: Result<(), &str> = retry_async(
                &RetryPolicy::single_attempt(),
                {
                    let calls = Arc::clone(&calls);
                    move |_| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err("transient")
                        }
                    }
                },
                |_| true,
            )
            .await;

            assert!(result.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn default_reconnect_policy_waits_three_seconds_every_time() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy, ReconnectPolicy::Fixed(DEFAULT_RECONNECT_DELAY));
        for attempt in [1, 2, 10, 1_000] {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn backoff_reconnect_policy_doubles_up_to_cap() {
        let policy = ReconnectPolicy::Backoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(3));
    }

    #[test]
    fn retry_delay_without_jitter_is_deterministic() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }
}
