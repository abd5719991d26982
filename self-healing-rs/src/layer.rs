//! # Resilience Layer
//!
//! Single handle over the five entry points calling code needs: classify,
//! retry, circuit-break, self-heal and capture. Every piece of state lives in
//! the instance; share it with `Arc`.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::capture::{CaptureContext, ErrorCapture};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::classifier::{classify, ClassifiedError};
use crate::collaborators::{LogStore, RestLogStore, TelemetrySink, TracingLogStore, TracingTelemetry};
use crate::config::Settings;
use crate::failure::AsRawFailure;
use crate::healing::{HealingOptions, QueryError, QueryResponse, SelfHealing};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::types::{HealingError, Result};

pub struct ResilienceLayer {
    breakers: Arc<CircuitBreakerRegistry>,
    capture: Arc<ErrorCapture>,
    healing: SelfHealing,
    default_retry: RetryPolicy,
}

impl std::fmt::Debug for ResilienceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceLayer")
            .field("breakers", &self.breakers)
            .field("capture", &self.capture)
            .field("default_retry", &self.default_retry)
            .finish()
    }
}

impl ResilienceLayer {
    /// Wires the layer around the given collaborators
    pub fn new(telemetry: Arc<dyn TelemetrySink>, store: Arc<dyn LogStore>, settings: &Settings) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(settings.circuit_breaker_config()));
        let capture = Arc::new(ErrorCapture::new(telemetry, Arc::clone(&store), settings.capture.clone()));
        let default_retry = settings.retry_policy();

        let healing = SelfHealing::new(Arc::clone(&breakers), store)
            .with_capture(Arc::clone(&capture))
            .with_default_retry(default_retry.clone());

        Self {
            breakers,
            capture,
            healing,
            default_retry,
        }
    }

    /// Builds the layer with a [`TracingTelemetry`] sink and either the
    /// configured [`RestLogStore`] or a [`TracingLogStore`]
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn LogStore> = match &settings.store {
            Some(store) => {
                info!(base_url = %store.base_url, "Using REST log store");
                Arc::new(RestLogStore::new(store.clone())?)
            }
            None => {
                info!("No log store configured, records are only logged");
                Arc::new(TracingLogStore::new())
            }
        };

        Ok(Self::new(Arc::new(TracingTelemetry::new()), store, settings))
    }

    pub fn classify<F: AsRawFailure + ?Sized>(&self, failure: &F) -> ClassifiedError {
        classify(failure)
    }

    /// Retries `operation` under `policy`, or the configured default
    pub async fn retry_execute<F, Fut, T, E>(&self, operation: F, policy: Option<RetryPolicy>) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: AsRawFailure,
    {
        let policy = policy.unwrap_or_else(|| self.default_retry.clone());
        RetryExecutor::new(policy).execute(operation).await
    }

    /// Runs `operation` behind the circuit for `key`
    pub async fn circuit_execute<F, Fut, T, E>(&self, key: &str, operation: F) -> std::result::Result<T, HealingError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.breakers.execute(key, operation).await
    }

    pub async fn self_heal<F, Fut, T, E>(
        &self,
        operation: F,
        options: HealingOptions<T>,
    ) -> std::result::Result<T, HealingError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: AsRawFailure,
    {
        self.healing.execute(operation, options).await
    }

    pub async fn self_heal_query<F, Fut, T>(
        &self,
        query: F,
        options: HealingOptions<QueryResponse<T>>,
    ) -> std::result::Result<QueryResponse<T>, HealingError<QueryError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueryResponse<T>>,
    {
        self.healing.execute_query(query, options).await
    }

    /// Never fails; returns the stored error log id when persisted
    pub async fn capture_error<F: AsRawFailure + ?Sized>(&self, failure: &F, context: CaptureContext) -> Option<String> {
        self.capture.capture(failure, context).await
    }

    pub async fn set_user(&self, user_id: &str, email: Option<&str>) {
        self.capture.set_user(user_id, email).await;
    }

    pub async fn clear_user(&self) {
        self.capture.clear_user().await;
    }

    /// Current state of every circuit the layer has seen
    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn capture(&self) -> &Arc<ErrorCapture> {
        &self.capture
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::classifier::ErrorCategory;
    use crate::collaborators::{MemoryLogStore, MemoryTelemetry, RestStoreConfig};
    use crate::types::Error;

    #[tokio::test]
    async fn test_from_settings_without_store() {
        let layer = ResilienceLayer::from_settings(&Settings::default()).unwrap();
        assert!(layer.circuits().is_empty());
        assert_eq!(layer.classify("request timed out").category, ErrorCategory::Network);

        // records go to the log output and still get an id
        assert!(layer.capture_error("Network Error", CaptureContext::new()).await.is_some());
    }

    #[test]
    fn test_from_settings_rejects_empty_store_url() {
        let settings = Settings {
            store: Some(RestStoreConfig::default()),
            ..Settings::default()
        };
        assert!(matches!(ResilienceLayer::from_settings(&settings), Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_circuit_execute_shares_registry() {
        let store = Arc::new(MemoryLogStore::new());
        let layer = ResilienceLayer::new(Arc::new(MemoryTelemetry::new()), store, &Settings::default());

        let result = layer
            .circuit_execute("uploads", || async { Err::<(), _>("boom".to_string()) })
            .await;
        assert!(matches!(result, Err(HealingError::Operation(_))));

        let circuits = layer.circuits();
        assert_eq!(circuits.len(), 1);
        assert_eq!(circuits[0].key, "uploads");
        assert_eq!(circuits[0].state, CircuitState::Closed);
        assert_eq!(circuits[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_retry_execute_uses_given_policy() {
        let layer = ResilienceLayer::from_settings(&Settings::default()).unwrap();
        let mut calls = 0;

        let result = layer
            .retry_execute(
                || {
                    calls += 1;
                    async { Err::<(), _>("network down".to_string()) }
                },
                Some(RetryPolicy::never()),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
