//! Retry with exponential backoff for transient failures.

use lattice_core::Result;
use lattice_core::pipeline::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry configuration for infrastructure errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            jitter: false,
        }
    }
}

/// Result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after the given (1-based) failed attempt:
    /// `initial * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let capped = self.initial_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter {
            capped.mul_f64(1.0 + 0.25 * rand::random::<f64>())
        } else {
            capped
        }
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or runs out of attempts. The closure receives the 1-based attempt.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Retried<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => {
                    return Retried {
                        result,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(true);
        for _ in 0..20 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retried = fast()
            .run(|_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Infrastructure("agent lost".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(retried.result.unwrap(), 7);
        assert_eq!(retried.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let retried: Retried<()> = fast()
            .run(|_| async { Err(Error::Infrastructure("down".to_string())) })
            .await;
        assert!(matches!(retried.result, Err(Error::Infrastructure(_))));
        assert_eq!(retried.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_not_retried() {
        let retried: Retried<()> = fast()
            .run(|_| async { Err(Error::ArtifactNotFound("x".to_string())) })
            .await;
        assert_eq!(retried.attempts, 1);
    }
}
