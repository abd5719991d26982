//! # Self-Healing Orchestrator
//!
//! Composes the circuit breaker, retry executor and an optional fallback
//! around a fallible operation. The circuit breaker wraps the retry loop, so
//! a short-circuited call is never retried. Every terminal failure produces
//! one [`HealingActionRecord`] in the log store.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{CaptureContext, ErrorCapture};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{classify_raw, ErrorCategory};
use crate::collaborators::LogStore;
use crate::failure::{excerpt, AsRawFailure, RawFailure};
use crate::monitoring::{HEALING_ACTIONS, HEALING_FALLBACKS, HEALING_PERSIST_FAILURES};
use crate::retry::{RetryExecutor, RetryOn, RetryPolicy};
use crate::types::HealingError;

/// Circuit used when the caller names none
pub const DEFAULT_CIRCUIT_KEY: &str = "default";

/// Circuit used by [`SelfHealing::execute_query`] when the caller names none
pub const QUERY_CIRCUIT_KEY: &str = "backend";

/// Message patterns retried by [`SelfHealing::execute_query`]
pub const QUERY_RETRY_PATTERNS: &[&str] = &["network", "timeout", "connection", "fetch"];

/// Longest error message excerpt kept on a healing record
pub const MAX_ERROR_EXCERPT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Retry,
    Skip,
    Fallback,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Retry => write!(f, "retry"),
            ActionType::Skip => write!(f, "skip"),
            ActionType::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Success,
    Failed,
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionResult::Success => write!(f, "success"),
            ActionResult::Failed => write!(f, "failed"),
        }
    }
}

/// How a terminal failure was handled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingActionRecord {
    pub id: Uuid,
    /// `fallback` when a fallback value was returned, otherwise `retry` for
    /// retryable failures and `skip` for the rest
    pub action_type: ActionType,
    /// Always `failed`: a record is only written when healing did not
    /// produce a real value
    pub action_result: ActionResult,
    /// Retries actually performed
    pub retry_count: u32,
    pub execution_time_ms: u64,
    pub circuit_key: String,
    pub error_category: ErrorCategory,
    /// At most [`MAX_ERROR_EXCERPT`] characters
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

/// Observer told about each healing outcome
pub type HealingObserver = Arc<dyn Fn(ActionType, ActionResult) + Send + Sync>;

/// Per-call options for [`SelfHealing::execute`]
#[derive(Clone)]
pub struct HealingOptions<T> {
    pub enable_retry: bool,
    pub enable_circuit_breaker: bool,
    pub enable_fallback: bool,
    /// Defaults to [`DEFAULT_CIRCUIT_KEY`]
    pub circuit_key: Option<String>,
    /// Defaults to the orchestrator's policy
    pub retry_policy: Option<RetryPolicy>,
    pub fallback: Option<T>,
    pub on_healing_action: Option<HealingObserver>,
    /// Context forwarded to the capture pipeline
    pub capture_context: Option<CaptureContext>,
    /// Send terminal operation failures to the capture pipeline
    pub report_failures: bool,
}

impl<T> Default for HealingOptions<T> {
    fn default() -> Self {
        Self {
            enable_retry: true,
            enable_circuit_breaker: true,
            enable_fallback: false,
            circuit_key: None,
            retry_policy: None,
            fallback: None,
            on_healing_action: None,
            capture_context: None,
            report_failures: true,
        }
    }
}

impl<T> HealingOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.enable_circuit_breaker = enabled;
        self
    }

    pub fn circuit_key(mut self, key: impl Into<String>) -> Self {
        self.circuit_key = Some(key.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Enables the fallback and sets its value
    pub fn fallback(mut self, value: T) -> Self {
        self.enable_fallback = true;
        self.fallback = Some(value);
        self
    }

    pub fn on_healing_action<F>(mut self, observer: F) -> Self
    where
        F: Fn(ActionType, ActionResult) + Send + Sync + 'static,
    {
        self.on_healing_action = Some(Arc::new(observer));
        self
    }

    pub fn capture_context(mut self, context: CaptureContext) -> Self {
        self.capture_context = Some(context);
        self
    }

    pub fn report_failures(mut self, enabled: bool) -> Self {
        self.report_failures = enabled;
        self
    }

    fn notify(&self, action: ActionType, result: ActionResult) {
        if let Some(observer) = &self.on_healing_action {
            observer(action, result);
        }
    }
}

impl<T> fmt::Debug for HealingOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealingOptions")
            .field("enable_retry", &self.enable_retry)
            .field("enable_circuit_breaker", &self.enable_circuit_breaker)
            .field("enable_fallback", &self.enable_fallback)
            .field("circuit_key", &self.circuit_key)
            .field("retry_policy", &self.retry_policy)
            .field("has_fallback", &self.fallback.is_some())
            .field("report_failures", &self.report_failures)
            .finish()
    }
}

/// Error half of a [`QueryResponse`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, thiserror::Error)]
#[error("{}", query_message(.message))]
pub struct QueryError {
    pub message: String,
    pub code: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

fn query_message(message: &str) -> &str {
    if message.is_empty() {
        "Query failed"
    } else {
        message
    }
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl AsRawFailure for QueryError {
    fn to_raw_failure(&self) -> RawFailure {
        let extra: Vec<String> = [
            self.code.as_ref().map(|c| format!("code: {}", c)),
            self.details.as_ref().map(|d| format!("details: {}", d)),
            self.hint.as_ref().map(|h| format!("hint: {}", h)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let failure = RawFailure::typed("QueryError", self.to_string());
        if extra.is_empty() {
            failure
        } else {
            failure.with_stack(extra.join("\n"))
        }
    }
}

/// A backend call that reports failure in-band as `(data, error)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse<T> {
    pub data: Option<T>,
    pub error: Option<QueryError>,
}

impl<T> QueryResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: QueryError) -> Self {
        Self { data: None, error: Some(error) }
    }
}

/// The orchestrator
pub struct SelfHealing {
    breakers: Arc<CircuitBreakerRegistry>,
    store: Arc<dyn LogStore>,
    capture: Option<Arc<ErrorCapture>>,
    default_retry: RetryPolicy,
}

impl fmt::Debug for SelfHealing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHealing")
            .field("breakers", &self.breakers)
            .field("capture", &self.capture.is_some())
            .field("default_retry", &self.default_retry)
            .finish_non_exhaustive()
    }
}

impl SelfHealing {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, store: Arc<dyn LogStore>) -> Self {
        Self {
            breakers,
            store,
            capture: None,
            default_retry: RetryPolicy::default(),
        }
    }

    /// Reports terminal operation failures through `capture`
    pub fn with_capture(mut self, capture: Arc<ErrorCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Policy used when a call brings none
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Runs `operation` under the configured protections. Returns the value,
    /// the fallback on terminal failure when enabled, or the original error.
    pub async fn execute<F, Fut, T, E>(
        &self,
        mut operation: F,
        options: HealingOptions<T>,
    ) -> Result<T, HealingError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AsRawFailure,
    {
        let started = Instant::now();
        let key = options
            .circuit_key
            .clone()
            .unwrap_or_else(|| DEFAULT_CIRCUIT_KEY.to_string());

        let retries = Arc::new(AtomicU32::new(0));
        let policy = options
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let executor = RetryExecutor::new(counting(policy, Arc::clone(&retries)));

        let outcome = match (options.enable_circuit_breaker, options.enable_retry) {
            (true, true) => self.breakers.execute(&key, || executor.execute(operation)).await,
            (true, false) => self.breakers.execute(&key, || operation()).await,
            (false, true) => executor.execute(operation).await.map_err(HealingError::Operation),
            (false, false) => operation().await.map_err(HealingError::Operation),
        };

        let error = match outcome {
            Ok(value) => {
                if options.enable_retry {
                    options.notify(ActionType::Retry, ActionResult::Success);
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let failure = error.to_raw_failure();
        let classified = classify_raw(&failure);
        let HealingOptions {
            enable_fallback,
            fallback,
            on_healing_action,
            capture_context,
            report_failures,
            ..
        } = options;
        let fallback = if enable_fallback { fallback } else { None };

        let action_type = if fallback.is_some() {
            ActionType::Fallback
        } else if classified.is_retryable {
            ActionType::Retry
        } else {
            ActionType::Skip
        };

        let record = HealingActionRecord {
            id: Uuid::new_v4(),
            action_type,
            action_result: ActionResult::Failed,
            retry_count: retries.load(Ordering::SeqCst),
            execution_time_ms: started.elapsed().as_millis() as u64,
            circuit_key: key,
            error_category: classified.category,
            error_message: excerpt(failure.message(), MAX_ERROR_EXCERPT),
            created_at: Utc::now(),
        };

        counter!(HEALING_ACTIONS, 1, "action_type" => action_type.to_string());
        warn!(
            circuit = %record.circuit_key,
            category = %record.error_category,
            action_type = %record.action_type,
            retry_count = %record.retry_count,
            execution_time_ms = %record.execution_time_ms,
            "Self-healing failed"
        );
        self.persist(&record).await;

        if report_failures && !error.is_circuit_open() {
            if let Some(capture) = &self.capture {
                let context = capture_context
                    .unwrap_or_default()
                    .field("circuit_key", record.circuit_key.clone())
                    .field("healing_action", record.action_type.to_string());
                capture.capture(&failure, context).await;
            }
        }

        let notify = |action, result| {
            if let Some(observer) = &on_healing_action {
                observer(action, result);
            }
        };

        match fallback {
            Some(value) => {
                counter!(HEALING_FALLBACKS, 1);
                info!(circuit = %record.circuit_key, "Returning fallback value");
                notify(ActionType::Fallback, ActionResult::Success);
                Ok(value)
            }
            None => {
                notify(ActionType::Retry, ActionResult::Failed);
                Err(error)
            }
        }
    }

    /// Runs a backend query that reports errors in-band. A present `error`
    /// counts as a failure; only network-looking failures are retried and the
    /// circuit key defaults to [`QUERY_CIRCUIT_KEY`].
    pub async fn execute_query<F, Fut, T>(
        &self,
        mut query: F,
        mut options: HealingOptions<QueryResponse<T>>,
    ) -> Result<QueryResponse<T>, HealingError<QueryError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueryResponse<T>>,
    {
        options
            .circuit_key
            .get_or_insert_with(|| QUERY_CIRCUIT_KEY.to_string());
        let policy = options
            .retry_policy
            .take()
            .unwrap_or_else(|| self.default_retry.clone())
            .retry_on(RetryOn::patterns(QUERY_RETRY_PATTERNS.iter().copied()));
        options.retry_policy = Some(policy);

        self.execute(
            move || {
                let pending = query();
                async move {
                    let response = pending.await;
                    match response.error {
                        Some(error) => Err(error),
                        None => Ok(response),
                    }
                }
            },
            options,
        )
        .await
    }

    async fn persist(&self, record: &HealingActionRecord) {
        if let Err(e) = self.store.insert_healing_action(record).await {
            counter!(HEALING_PERSIST_FAILURES, 1);
            debug!(error = %e, circuit = %record.circuit_key, "Failed to log healing action");
        }
    }
}

/// Wraps the policy's retry observer so every real retry is counted
fn counting(policy: RetryPolicy, retries: Arc<AtomicU32>) -> RetryPolicy {
    let inner = policy.on_retry.clone();
    let mut policy = policy;
    policy.on_retry = Some(Arc::new(move |attempt: u32, failure: &RawFailure| {
        retries.fetch_add(1, Ordering::SeqCst);
        if let Some(inner) = &inner {
            inner(attempt, failure);
        }
    }));
    policy
}
