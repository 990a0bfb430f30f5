//! Retry wrapper for venue calls.
//!
//! Transient failures (network, rate limit) are retried with exponential
//! backoff. Terminal failures surface immediately. A call that could create
//! a duplicate side effect is retried only when it carries an idempotency
//! token the venue will recognize.

use super::clock::{Clock, SystemClock};
use crate::config::RetryConfig;
use crate::error::{ErrorClass, ExchangeError};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Bounded exponential backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Whether repeating a call is safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Idempotency {
    /// Reads and cancels: repeating has no extra effect.
    Safe,
    /// Side-effecting call tagged with a client token the venue deduplicates on.
    Token(String),
    /// Side-effecting call without protection. Never retried.
    Unsafe,
}

impl Idempotency {
    fn allows_retry(&self) -> bool {
        !matches!(self, Idempotency::Unsafe)
    }
}

/// State of one wrapped call, handed to the operation on each attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation: String,
    /// 1-based attempt number of the call being made
    pub attempt: u32,
    pub last_error: Option<ErrorClass>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryContext {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            attempt: 0,
            last_error: None,
            next_retry_at: None,
        }
    }

    /// True on every attempt after the first.
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// A wrapped call that did not succeed.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct CallFailure {
    pub operation: String,
    pub attempts: u32,
    /// Retries were used up on transient errors
    pub exhausted: bool,
    #[source]
    pub source: ExchangeError,
}

impl CallFailure {
    /// Exhausted retries count as terminal.
    pub fn class(&self) -> ErrorClass {
        if self.exhausted {
            ErrorClass::Terminal
        } else {
            self.source.class()
        }
    }

    /// The venue refused the request itself (as opposed to being unreachable).
    pub fn is_rejection(&self) -> bool {
        !self.source.is_transient()
    }
}

/// Executes venue calls under a [`RetryPolicy`].
#[derive(Clone)]
pub struct ResilientCaller {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ResilientCaller {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn with_system_clock(policy: RetryPolicy) -> Self {
        Self::new(policy, Arc::new(SystemClock))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying transient failures as the policy and idempotency allow.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        idempotency: Idempotency,
        mut op: F,
    ) -> Result<T, CallFailure>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut ctx = RetryContext::new(operation);

        loop {
            ctx.attempt += 1;
            let error = match op(ctx.clone()).await {
                Ok(value) => {
                    if ctx.is_retry() {
                        debug!(operation, attempt = ctx.attempt, "Call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            ctx.last_error = Some(error.class());
            let failure = |exhausted: bool| CallFailure {
                operation: operation.to_string(),
                attempts: ctx.attempt,
                exhausted,
                source: error.clone(),
            };

            if !error.is_transient() {
                return Err(failure(false));
            }

            if !idempotency.allows_retry() {
                warn!(operation, error = %error, "Transient failure on non-idempotent call, not retrying");
                return Err(failure(false));
            }

            if ctx.attempt >= self.policy.max_attempts {
                warn!(
                    operation,
                    attempts = ctx.attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(failure(true));
            }

            let delay = self.policy.backoff_for(ctx.attempt);
            let step = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            ctx.next_retry_at = Some(self.clock.now() + step);

            warn!(
                operation,
                attempt = ctx.attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );

            self.clock.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(500),
            multiplier: 2,
        }
    }

    fn caller() -> (ResilientCaller, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (ResilientCaller::new(policy(), clock.clone()), clock)
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.backoff_for(1), Duration::from_millis(200));
        assert_eq!(p.backoff_for(2), Duration::from_millis(400));
        assert_eq!(p.backoff_for(3), Duration::from_millis(500));
        assert_eq!(p.backoff_for(30), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_success() {
        let (caller, clock) = caller();
        let calls = AtomicU32::new(0);

        let result = caller
            .call("get_orderbook", Idempotency::Safe, |ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExchangeError::Network(format!("attempt {}", ctx.attempt)))
                    } else {
                        Ok(ctx.attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let (caller, clock) = caller();
        let calls = AtomicU32::new(0);

        let err = caller
            .call("place_order", Idempotency::Token("abc".into()), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ExchangeError::RejectedOrder("margin".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.exhausted);
        assert!(err.is_rejection());
        assert_eq!(err.class(), ErrorClass::Terminal);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_call_never_retried() {
        let (caller, _clock) = caller();
        let calls = AtomicU32::new(0);

        let err = tokio_test::assert_err!(
            caller
                .call("place_order", Idempotency::Unsafe, |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ExchangeError::Network("reset".into())) }
                })
                .await
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_exhaustion_is_terminal() {
        let (caller, clock) = caller();

        let err = caller
            .call("get_positions", Idempotency::Safe, |_| async {
                Err::<(), _>(ExchangeError::RateLimited("429".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert!(err.exhausted);
        assert_eq!(err.class(), ErrorClass::Terminal);
        assert!(!err.is_rejection());
        assert_eq!(clock.sleeps().len(), 3);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 3,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_for(2), Duration::from_millis(30));
    }
}
