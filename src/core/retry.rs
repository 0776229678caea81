//! Bounded retry with exponential backoff and jitter.
//!
//! Every fallible external call in the engine goes through [`Retry::execute`]
//! so the backoff policy lives in one place.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::error::EngineError;

/// Retry policy for external calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Upper bound of the uniform random jitter added to each delay
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    /// Per-attempt timeout in seconds (`None` disables it)
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_jitter() -> u64 {
    1000
}
fn default_attempt_timeout() -> Option<u64> {
    Some(120)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            jitter_ms: default_jitter(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Policy without any waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
            attempt_timeout_secs: None,
        }
    }

    /// `min(initial * 2^attempt + jitter, max)` for a 0-indexed attempt
    pub fn delay_with_jitter(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exponential = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential
            .saturating_add(jitter_ms)
            .min(self.max_delay_ms);
        Duration::from_millis(capped)
    }

    /// Delay before retrying after the 0-indexed `attempt` failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.delay_with_jitter(attempt, jitter)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }
}

/// Decides whether an error on a 0-indexed attempt is worth retrying
pub type RetryPredicate = Arc<dyn Fn(&EngineError, u32) -> bool + Send + Sync>;

/// A retry policy bound to its predicate
#[derive(Clone)]
pub struct Retry {
    policy: RetryPolicy,
    should_retry: RetryPredicate,
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry").field("policy", &self.policy).finish()
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Retry {
    /// Retry transient failures only
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            should_retry: Arc::new(|error: &EngineError, _attempt: u32| error.is_retryable()),
        }
    }

    /// Replace the retry predicate
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&EngineError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
    ///
    /// Non-retryable errors are returned unchanged; exhaustion wraps the last
    /// error in [`EngineError::RetryExhausted`] with the attempt count.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let result = match self.policy.attempt_timeout() {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::transient(format!(
                        "{} timed out after {:?}",
                        operation, limit
                    ))),
                },
                None => op().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let attempts = attempt + 1;

            if !(self.should_retry)(&error, attempt) {
                debug!(operation, attempts, error = %error, "Not retrying due to error type");
                return Err(error);
            }

            if attempts >= max_attempts {
                error!(operation, attempts, error = %error, "Operation failed permanently");
                return Err(EngineError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts,
                    source: Box::new(error),
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                operation,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_with_jitter(0, 0), Duration::from_millis(1000));
        assert_eq!(policy.delay_with_jitter(1, 0), Duration::from_millis(2000));
        assert_eq!(policy.delay_with_jitter(2, 0), Duration::from_millis(4000));
        assert_eq!(policy.delay_with_jitter(3, 250), Duration::from_millis(8250));
        assert_eq!(policy.delay_with_jitter(4, 0), Duration::from_millis(10000)); // Capped
        assert_eq!(policy.delay_with_jitter(60, 999), Duration::from_millis(10000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1).as_millis() as u64;
            assert!((2000..=3000).contains(&delay));
        }
    }

    #[test]
    fn test_policy_from_yaml_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.attempt_timeout_secs, Some(120));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let retry = Retry::new(RetryPolicy::immediate(3));

        let value = retry
            .execute("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::transient("HTTP 503"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_attaches_attempt_count() {
        let retry = Retry::new(RetryPolicy::immediate(3));

        let err = retry
            .execute("always_down", || async {
                Err::<(), _>(EngineError::transient("HTTP 502"))
            })
            .await
            .unwrap_err();

        match err {
            EngineError::RetryExhausted {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "always_down");
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("HTTP 502"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let retry = Retry::new(RetryPolicy::immediate(5));

        let err = retry
            .execute("bad_request", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(EngineError::validation("missing visit_id"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_sees_attempt_index() {
        let seen = std::sync::Mutex::new(Vec::new());
        let retry = Retry::new(RetryPolicy::immediate(5)).with_predicate(|_, attempt| attempt < 1);

        let _ = retry
            .execute("counted", || {
                seen.lock().unwrap().push(());
                async { Err::<(), _>(EngineError::transient("boom")) }
            })
            .await;

        // Attempt 0 retried, attempt 1 refused
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let policy = RetryPolicy {
            attempt_timeout_secs: Some(0),
            ..RetryPolicy::immediate(1)
        };
        let retry = Retry::new(policy);

        let err = retry
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, EngineError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }
}
