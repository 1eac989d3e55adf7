//! Bounded retry with exponential backoff.
//!
//! One policy type drives every retrying flow: signaling reconnects, ICE
//! restarts, consumer track acquisition and stall recovery.

use std::future::Future;
use std::time::Duration;

use nexus_common::config::BackoffConfig;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

/// Why [`RetryPolicy::retry`] gave up.
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    Cancelled,
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: initial_delay.saturating_mul(16),
            multiplier: 2.0,
        }
    }

    pub fn from_config(cfg: &BackoffConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay: cfg.initial_delay(),
            max_delay: cfg.max_delay(),
            multiplier: cfg.multiplier.max(1.0),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds, the attempt budget is spent or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn retry<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = op(attempt) => outcome,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !self.allows(attempt) => {
                    tracing::warn!(op = label, attempts = attempt, error = %e, "Giving up after retries");
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(op = label, attempt, ?delay, error = %e, "Retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(30), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let result: Result<u32, RetryError<String>> = policy
            .retry(&CancellationToken::new(), "test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_budget_is_spent() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let result: Result<(), RetryError<&str>> = policy
            .retry(&CancellationToken::new(), "test", |_| async { Err("nope") })
            .await;
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last: "nope"
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        let result: Result<(), RetryError<&str>> = policy
            .retry(&cancel, "test", |_| async { Err("nope") })
            .await;
        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
