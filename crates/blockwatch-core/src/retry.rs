//! Exponential backoff for block source calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::WatchError;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Spreads each delay uniformly over `backoff * (1 ± jitter_fraction / 2)`.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy. Computes the next delay given the attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..Default::default()
        })
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64) as u64;

        let jitter_range = (capped as f64 * self.config.jitter_fraction.clamp(0.0, 1.0)) as u64;
        let offset = if jitter_range > 0 {
            rand::rng().random_range(0..jitter_range)
        } else {
            0
        };
        Some(Duration::from_millis(capped.saturating_sub(jitter_range / 2) + offset))
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted.
///
/// Sleeps between attempts; returns [`WatchError::Cancelled`] as soon as
/// `cancel` fires.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, WatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WatchError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WatchError::Cancelled),
            r = op() => r,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => match policy.next_delay(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        what,
                        "retrying block source call"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(WatchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tracing::error!(attempt, error = %e, what, "max retries exceeded");
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 6,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        });
        let delays: Vec<u128> = (1..=6)
            .map(|n| policy.next_delay(n).unwrap().as_millis())
            .collect();
        assert_eq!(delays, [50, 100, 200, 300, 300, 300]);
        assert!(policy.next_delay(0).is_none());
        assert!(policy.next_delay(7).is_none());
    }

    #[test]
    fn jitter_stays_within_its_band() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.2,
        });
        let delays: Vec<u128> = (0..200)
            .map(|_| policy.next_delay(1).unwrap().as_millis())
            .collect();
        assert!(delays.iter().all(|d| (900..1100).contains(d)), "{delays:?}");
        // 200 draws from a 200ms band are not all equal.
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn should_retry_boundary() {
        let policy = fast(2);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(RetryPolicy::none().next_delay(1).is_none());
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = retry_with_backoff(&fast(3), &token, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(WatchError::Source("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<(), _> = retry_with_backoff(&fast(2), &token, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WatchError::Timeout { ms: 1 }) }
        })
        .await;
        assert_eq!(result, Err(WatchError::Timeout { ms: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<(), _> = retry_with_backoff(&fast(5), &token, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WatchError::BlockNotFound { hash: "0xa".into() }) }
        })
        .await;
        assert!(matches!(result, Err(WatchError::BlockNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), _> =
            retry_with_backoff(&fast(5), &token, "test", || async { Ok(()) }).await;
        assert_eq!(result, Err(WatchError::Cancelled));
    }
}
