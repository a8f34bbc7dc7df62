//! Bounded Retry
//!
//! Wraps a single provider launch: each attempt runs under the per-attempt
//! timeout, and transient failures are retried after an exponential
//! backoff with jitter. Permanent failures return immediately.

use std::future::Future;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// Retry settings for one provider launch
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Backoff before the second attempt
    pub initial_backoff: Duration,

    /// Upper bound on any backoff
    pub max_backoff: Duration,

    /// Backoff growth per attempt
    pub multiplier: f64,

    /// Add up to 25% jitter to each backoff
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff after failed attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * 1000.0
            * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64() * 1000.0);

        let duration_ms = if self.use_jitter {
            let jitter = rand::random::<f64>() * 0.25;
            capped * (1.0 + jitter)
        } else {
            capped
        };

        Duration::from_micros((duration_ms.max(0.0) * 1000.0) as u64)
    }

    /// Run `attempt` until it succeeds, fails permanently or attempts run out
    ///
    /// Each attempt is bounded by `timeout`; an attempt that exceeds it
    /// fails with `AttemptTimeout`, which is retried like any transient
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error.
    pub async fn run<T, F, Fut>(
        &self,
        provider: &str,
        timeout: Duration,
        mut attempt: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut n = 0;
        loop {
            let result = match tokio::time::timeout(timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::AttemptTimeout {
                    provider: provider.to_string(),
                    timeout,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && n + 1 < attempts => {
                    let backoff = self.backoff_for_attempt(n);
                    tracing::debug!(
                        provider,
                        attempt = n + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient provider failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
            use_jitter: false,
        }
    }

    #[test]
    fn test_backoff() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(300)); // Capped
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            use_jitter: true,
            ..no_jitter()
        };
        for _ in 0..100 {
            let backoff = policy.backoff_for_attempt(0);
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff <= Duration::from_millis(125));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = no_jitter()
            .run("p", Duration::from_secs(1), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GatewayError::transient("p", "reset"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = no_jitter()
            .run("p", Duration::from_secs(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::permanent("p", "bad request"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = RetryPolicy::default()
            .run("slow", Duration::from_millis(100), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending().await
            })
            .await;

        assert!(matches!(result, Err(GatewayError::AttemptTimeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
