//! Retry Policy
//!
//! Bounded exponential backoff shared by the connection supervisor (whole
//! connect attempts) and the log sender (individual frame writes).
//!
//! A policy with `retries = N` makes at most `N + 1` attempts. The first
//! attempt runs immediately; retry `k` waits
//! `initial_delay * multiplier^k`, optionally capped at `max_delay`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Ceiling applied when no explicit cap is configured, so large retry
/// counts never overflow `Duration`
const DELAY_CEILING: Duration = Duration::from_secs(3600);

/// Exponential backoff configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryBehavior {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Factor applied to the delay after each retry
    pub multiplier: f64,
    /// Optional upper bound for any single delay
    pub max_delay: Option<Duration>,
}

impl Default for RetryBehavior {
    /// Connection-level policy: 10 retries, 100 ms initial delay, doubling
    fn default() -> Self {
        Self {
            retries: 10,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: None,
        }
    }
}

impl RetryBehavior {
    /// Create a doubling policy
    #[must_use]
    pub fn new(retries: u32, initial_delay: Duration) -> Self {
        Self {
            retries,
            initial_delay,
            ..Self::default()
        }
    }

    /// Write-level policy: 5 retries, 100 ms initial delay, doubling
    #[must_use]
    pub fn short() -> Self {
        Self::new(5, Duration::from_millis(100))
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Total attempts this policy allows
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based)
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let cap = self.max_delay.unwrap_or(DELAY_CEILING);
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            cap
        } else if nanos <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// Start tracking one retry sequence
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries_used: 0,
        }
    }

    /// Run `op` until it succeeds or the policy is exhausted
    ///
    /// `op` receives the 0-based attempt number. Returns the last error once
    /// all attempts have failed.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_while(op, |_| true).await
    }

    /// Like [`RetryBehavior::run`], but stops early when `retryable` rejects
    /// an error
    pub async fn run_while<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => {
                    tracing::debug!(attempt, error = %e, "Attempt failed with a non-retryable error");
                    return Err(e);
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::debug!(attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                },
            }
        }
    }
}

/// Progress through one retry sequence
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryBehavior,
    retries_used: u32,
}

impl Backoff {
    /// Delay before the next retry, or `None` when retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_used >= self.policy.retries {
            return None;
        }
        let delay = self.policy.delay_for_retry(self.retries_used);
        self.retries_used += 1;
        Some(delay)
    }

    /// Retries consumed so far
    #[must_use]
    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::time::Instant;

    #[test]
    fn test_presets() {
        let default = RetryBehavior::default();
        assert_eq!(default.retries, 10);
        assert_eq!(default.initial_delay, Duration::from_millis(100));

        let short = RetryBehavior::short();
        assert_eq!(short.retries, 5);
        assert_eq!(short.max_attempts(), 6);
    }

    #[test]
    fn test_delays_double() {
        let policy = RetryBehavior::short();
        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_delay_respects_cap() {
        let policy = RetryBehavior::default().with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(200), Duration::from_millis(500));
    }

    #[test]
    fn test_delay_without_cap_never_overflows() {
        let policy = RetryBehavior::new(u32::MAX, Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(u32::MAX), DELAY_CEILING);
    }

    #[test]
    fn test_backoff_exhausts() {
        let mut backoff = RetryBehavior::new(2, Duration::from_millis(10)).backoff();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.retries_used(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_op_makes_n_plus_one_attempts() {
        let policy = RetryBehavior::new(4, Duration::from_millis(100));
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&attempts);
        let result: Result<(), String> = policy
            .run(move |attempt| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().push((attempt, Instant::now()));
                    Err("refused".to_string())
                }
            })
            .await;

        assert_eq!(result, Err("refused".to_string()));

        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 5);

        let gaps: Vec<Duration> = attempts
            .windows(2)
            .map(|pair| pair[1].1 - pair[0].1)
            .collect();
        assert!(gaps.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(gaps[0] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = RetryBehavior::short()
            .run(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("busy")
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), &str> = RetryBehavior::default()
            .run_while(
                move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("untrusted")
                    }
                },
                |e| *e != "untrusted",
            )
            .await;

        assert_eq!(result, Err("untrusted"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
