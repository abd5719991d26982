//! # Retry Mechanism
//!
//! Sequential retries with capped exponential backoff. The delay before retry
//! `i` (1-indexed) is `min(initial_delay * multiplier^(i-1), max_delay)`.
//! Jitter is available through `jitter_factor` but is off by default.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::classifier::is_network_failure;
use crate::failure::{AsRawFailure, RawFailure};
use crate::monitoring::{RETRY_ATTEMPTS, RETRY_EXHAUSTED, RETRY_SUCCESS_AFTER_RETRY, RETRY_DELAY_MS};

/// Predicate invoked with the failure to decide whether to retry
pub type RetryPredicate = Arc<dyn Fn(&RawFailure) -> bool + Send + Sync>;

/// Observer invoked with `(attempt, failure)` before each retry delay
pub type RetryObserver = Arc<dyn Fn(u32, &RawFailure) + Send + Sync>;

/// Which failures are worth another attempt
#[derive(Clone, Default)]
pub enum RetryOn {
    /// Failures the classifier puts in the network category
    #[default]
    NetworkFailures,
    /// Failures whose lowercased message contains any of these patterns
    Patterns(Vec<String>),
    /// Caller-supplied predicate
    Custom(RetryPredicate),
}

impl RetryOn {
    /// Retries failures matching any pattern; an empty list means
    /// [`RetryOn::NetworkFailures`]
    pub fn patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(|p| p.into().to_lowercase()).collect();
        if patterns.is_empty() {
            RetryOn::NetworkFailures
        } else {
            RetryOn::Patterns(patterns)
        }
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&RawFailure) -> bool + Send + Sync + 'static,
    {
        RetryOn::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, failure: &RawFailure) -> bool {
        match self {
            RetryOn::NetworkFailures => is_network_failure(failure),
            RetryOn::Patterns(patterns) => {
                let message = failure.message().to_lowercase();
                patterns.iter().any(|pattern| message.contains(pattern.as_str()))
            }
            RetryOn::Custom(predicate) => predicate(failure),
        }
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryOn::NetworkFailures => write!(f, "NetworkFailures"),
            RetryOn::Patterns(patterns) => f.debug_tuple("Patterns").field(patterns).finish(),
            RetryOn::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Retry policy for a single invocation
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Fraction (0.0 - 1.0) of each delay randomized in either direction
    pub jitter_factor: f64,
    /// Retryability predicate
    pub retry_on: RetryOn,
    /// Called once per failed attempt that will be retried
    pub on_retry: Option<RetryObserver>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            retry_on: RetryOn::default(),
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &RawFailure) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Delay before retry `attempt` (1-indexed), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = base_ms * self.backoff_multiplier.powi(exponent);

        // powi overflows to infinity for large exponents; min() caps it
        let capped_ms = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// Delay before retry `attempt` (1-indexed), with jitter applied if
    /// configured
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let range = base_ms * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-range..=range);
        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis((base_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .field("retry_on", &self.retry_on)
            .field("on_retry", &self.on_retry.as_ref().map(|_| ".."))
            .finish()
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy(max_retries={}, initial={:?}, max={:?}, multiplier={})",
            self.max_retries, self.initial_delay, self.max_delay, self.backoff_multiplier
        )
    }
}

/// Executor for retry operations with exponential backoff
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent. The last error is returned unchanged.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AsRawFailure,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            counter!(RETRY_ATTEMPTS, 1);

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        counter!(RETRY_SUCCESS_AFTER_RETRY, 1);
                        info!(
                            attempt = %(attempt + 1),
                            duration_ms = %started.elapsed().as_millis(),
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let failure = error.to_raw_failure();

            if !self.policy.retry_on.matches(&failure) {
                debug!(
                    attempt = %(attempt + 1),
                    error = %failure,
                    "Not retrying non-retryable error"
                );
                return Err(error);
            }

            if attempt >= self.policy.max_retries {
                counter!(RETRY_EXHAUSTED, 1);
                warn!(
                    attempts = %(attempt + 1),
                    max_retries = %self.policy.max_retries,
                    duration_ms = %started.elapsed().as_millis(),
                    error = %failure,
                    "Giving up after retries"
                );
                return Err(error);
            }

            attempt += 1;
            let backoff = self.policy.delay_for(attempt);

            if let Some(observer) = &self.policy.on_retry {
                observer(attempt, &failure);
            }

            debug!(
                attempt = %attempt,
                max_retries = %self.policy.max_retries,
                backoff_ms = %backoff.as_millis(),
                error = %failure,
                "Retrying after error"
            );
            histogram!(RETRY_DELAY_MS, backoff.as_millis() as f64);

            sleep(backoff).await;
        }
    }
}

/// Runs `operation` under `policy`
pub async fn retry_execute<F, Fut, T, E>(operation: F, policy: &RetryPolicy) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: AsRawFailure,
{
    RetryExecutor::new(policy.clone()).execute(operation).await
}
