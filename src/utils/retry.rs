//! Retry utilities for resilient operations
//!
//! Exponential backoff with a cap. The caller decides which errors are worth
//! retrying, and gets back the delays that were actually slept so they can
//! be reported alongside the final result.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max attempts
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Check that the schedule grows and terminates
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than 0".to_string());
        }
        if self.max_attempts > 1 && self.max_delay_ms <= self.base_delay_ms {
            return Err("max_delay_ms must be greater than base_delay_ms".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max_delay_ms must not be below base_delay_ms".to_string());
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier <= 1.0 {
            return Err("backoff_multiplier must be greater than 1.0".to_string());
        }
        Ok(())
    }

    /// Delay slept after the `failures`-th consecutive failure
    ///
    /// `base * multiplier^(failures - 1)`, capped at `max_delay_ms`.
    pub fn calculate_delay(&self, failures: u32) -> Duration {
        let delay_ms = if failures == 0 {
            0
        } else {
            let exponential = self.base_delay_ms as f64
                * self.backoff_multiplier.powi(failures.saturating_sub(1) as i32);
            if exponential >= self.max_delay_ms as f64 {
                self.max_delay_ms
            } else {
                exponential as u64
            }
        };

        Duration::from_millis(delay_ms)
    }
}

/// Result of a retried operation with its attempt history
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,

    /// Number of times the operation ran
    pub attempts: u32,

    /// Backoff delays slept between attempts, in order
    pub delays: Vec<Duration>,
}

/// Execute an operation with retry logic, using a custom retry predicate
///
/// Errors for which `should_retry` returns `false` end the loop
/// immediately. The last error is returned once `max_attempts` is reached.
///
/// # Example
///
/// ```no_run
/// use thumbwheel::utils::retry::{with_retry_if, RetryConfig};
/// use thumbwheel::utils::error::PublishError;
///
/// async fn publish() -> Result<(), PublishError> {
///     Ok(())
/// }
///
/// # async fn run() {
/// let config = RetryConfig::default();
/// let outcome = with_retry_if(&config, || publish(), PublishError::is_retryable).await;
/// assert!(outcome.result.is_ok());
/// # }
/// ```
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delays = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    delays,
                };
            }
            Err(e) => {
                if !should_retry(&e) {
                    debug!(attempt = attempt, error = %e, "Non-retryable error encountered");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        delays,
                    };
                }

                if attempt >= max_attempts {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Retries exhausted"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        delays,
                    };
                }

                let delay = config.calculate_delay(attempt);
                debug!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after delay"
                );
                tokio::time::sleep(delay).await;
                delays.push(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn is_transient(e: &TestError) -> bool {
        *e == TestError::Transient
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_first_attempt() {
        let config = RetryConfig::new(3);
        let outcome =
            with_retry_if(&config, || async { Ok::<_, TestError>(42) }, is_transient).await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let config = RetryConfig::new(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let outcome = with_retry_if(
            &config,
            move || {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        return Err(TestError::Transient);
                    }
                    Ok(42)
                }
            },
            is_transient,
        )
        .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.delays,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let config = RetryConfig::new(2);
        let outcome: RetryOutcome<(), _> =
            with_retry_if(&config, || async { Err(TestError::Transient) }, is_transient).await;

        assert_eq!(outcome.result.unwrap_err(), TestError::Transient);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.delays.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_predicate_fails_fast() {
        let config = RetryConfig::new(3);
        let outcome: RetryOutcome<(), _> =
            with_retry_if(&config, || async { Err(TestError::Permanent) }, is_transient).await;

        assert_eq!(outcome.result.unwrap_err(), TestError::Permanent);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_actually_sleeps() {
        let config = RetryConfig::with_delays(3, 100, 10_000);
        let start = tokio::time::Instant::now();
        let _: RetryOutcome<(), _> =
            with_retry_if(&config, || async { Err(TestError::Transient) }, is_transient).await;

        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::default();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(0));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(2000));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::with_delays(10, 1000, 5000);

        // Should not exceed max_delay_ms
        assert_eq!(config.calculate_delay(10), Duration::from_millis(5000));
        assert_eq!(config.calculate_delay(200), Duration::from_millis(5000));
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::new(0).validate().is_err());
        assert!(RetryConfig::with_delays(3, 1000, 10).validate().is_err());

        // A cap equal to the base would sleep the same delay twice
        assert!(RetryConfig::with_delays(3, 1000, 1000).validate().is_err());
        assert!(RetryConfig::with_delays(1, 1000, 1000).validate().is_ok());
        assert!(RetryConfig::with_delays(2, 1000, 1001).validate().is_ok());

        let flat = RetryConfig {
            backoff_multiplier: 1.0,
            ..Default::default()
        };
        assert!(flat.validate().is_err());
    }
}
