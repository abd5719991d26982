//! # Circuit Breaker
//!
//! One breaker per dependency key, created lazily in the closed state.
//!
//! - Closed -> Open once consecutive failures reach `failure_threshold`
//! - Open -> HalfOpen on the first call after `reset_timeout` has elapsed
//!   since the last failure; that call runs as a probe
//! - HalfOpen -> Closed after `success_threshold` consecutive successes
//! - HalfOpen -> Open on any failure
//!
//! Each circuit sits behind its own mutex so the check-then-transition on
//! its counters is atomic under parallel callers. The lock is never held
//! across the wrapped operation. Concurrent probes in the half-open state are
//! all admitted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::monitoring::{CIRCUIT_CLOSED, CIRCUIT_HALF_OPENED, CIRCUIT_OPENED, CIRCUIT_REJECTED, CIRCUIT_STATE};
use crate::types::{CircuitOpenError, HealingError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, probe requests allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration shared by every circuit in a registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit
    pub failure_threshold: u32,
    /// Cool-down measured from the last failure before a probe is allowed
    pub reset_timeout: Duration,
    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_failure_time: None,
        }
    }
}

/// Read-only view of one circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Registry of independent circuits keyed by dependency name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<CircuitStats>>>>,
}

fn lock(stats: &Mutex<CircuitStats>) -> MutexGuard<'_, CircuitStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, key: &str) -> Arc<Mutex<CircuitStats>> {
        {
            let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stats) = circuits.get(key) {
                return Arc::clone(stats);
            }
        }

        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            circuits
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitStats::new()))),
        )
    }

    /// Runs `operation` if the circuit for `key` allows it and records the
    /// outcome. Fails fast with [`CircuitOpenError`] while the circuit is
    /// open and cooling down; the operation is not invoked in that case.
    pub async fn execute<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, HealingError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire(key)?;

        match operation().await {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(key);
                Err(HealingError::Operation(err))
            }
        }
    }

    /// Admits or rejects a call, moving an expired open circuit to half-open
    pub fn try_acquire(&self, key: &str) -> Result<(), CircuitOpenError> {
        let circuit = self.circuit(key);
        let mut stats = lock(&circuit);

        if stats.state != CircuitState::Open {
            return Ok(());
        }

        let cooled_down = stats
            .last_failure_at
            .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);

        if cooled_down {
            stats.state = CircuitState::HalfOpen;
            stats.consecutive_successes = 0;
            counter!(CIRCUIT_HALF_OPENED, 1, "circuit" => key.to_string());
            gauge!(CIRCUIT_STATE, CircuitState::HalfOpen.gauge_value(), "circuit" => key.to_string());
            info!(circuit = %key, "Circuit HALF-OPEN: Probing recovery");
            return Ok(());
        }

        let remaining = stats
            .last_failure_at
            .map(|at| self.config.reset_timeout.saturating_sub(at.elapsed()))
            .unwrap_or_default();

        counter!(CIRCUIT_REJECTED, 1, "circuit" => key.to_string());
        debug!(
            circuit = %key,
            remaining_ms = %remaining.as_millis(),
            "Circuit open, request rejected"
        );
        Err(CircuitOpenError::new(key))
    }

    /// Records a successful call
    pub fn record_success(&self, key: &str) {
        let circuit = self.circuit(key);
        let mut stats = lock(&circuit);

        match stats.state {
            CircuitState::HalfOpen => {
                stats.consecutive_successes += 1;
                if stats.consecutive_successes >= self.config.success_threshold {
                    stats.state = CircuitState::Closed;
                    stats.consecutive_failures = 0;
                    stats.consecutive_successes = 0;
                    counter!(CIRCUIT_CLOSED, 1, "circuit" => key.to_string());
                    gauge!(CIRCUIT_STATE, CircuitState::Closed.gauge_value(), "circuit" => key.to_string());
                    info!(
                        circuit = %key,
                        threshold = %self.config.success_threshold,
                        "Circuit CLOSED: Service recovered"
                    );
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                stats.consecutive_failures = 0;
            }
        }
    }

    /// Records a failed call
    pub fn record_failure(&self, key: &str) {
        let circuit = self.circuit(key);
        let mut stats = lock(&circuit);

        stats.consecutive_failures += 1;
        stats.last_failure_at = Some(Instant::now());
        stats.last_failure_time = Some(Utc::now());

        match stats.state {
            CircuitState::HalfOpen => {
                stats.state = CircuitState::Open;
                stats.consecutive_successes = 0;
                counter!(CIRCUIT_OPENED, 1, "circuit" => key.to_string());
                gauge!(CIRCUIT_STATE, CircuitState::Open.gauge_value(), "circuit" => key.to_string());
                warn!(circuit = %key, "Circuit REOPENED: Failed in half-open state");
            }
            CircuitState::Closed if stats.consecutive_failures >= self.config.failure_threshold => {
                stats.state = CircuitState::Open;
                counter!(CIRCUIT_OPENED, 1, "circuit" => key.to_string());
                gauge!(CIRCUIT_STATE, CircuitState::Open.gauge_value(), "circuit" => key.to_string());
                warn!(
                    circuit = %key,
                    failure_count = %stats.consecutive_failures,
                    threshold = %self.config.failure_threshold,
                    "Circuit OPEN: Failure threshold exceeded"
                );
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Current state; unknown keys report closed
    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).map_or(CircuitState::Closed, |s| s.state)
    }

    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let circuit = {
            let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
            circuits.get(key).map(Arc::clone)?
        };
        let stats = lock(&circuit);
        Some(CircuitSnapshot {
            key: key.to_string(),
            state: stats.state,
            consecutive_failures: stats.consecutive_failures,
            consecutive_successes: stats.consecutive_successes,
            last_failure_at: stats.last_failure_time,
        })
    }

    /// Snapshots of every known circuit, ordered by key
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut keys: Vec<String> = {
            let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
            circuits.keys().cloned().collect()
        };
        keys.sort();
        keys.iter().filter_map(|key| self.snapshot(key)).collect()
    }

    /// Forgets a circuit; the next reference recreates it closed
    pub fn reset(&self, key: &str) {
        let removed = self
            .circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if removed {
            gauge!(CIRCUIT_STATE, CircuitState::Closed.gauge_value(), "circuit" => key.to_string());
            info!(circuit = %key, "Circuit reset");
        }
    }

    pub fn reset_all(&self) {
        self.circuits.write().unwrap_or_else(PoisonError::into_inner).clear();
        info!("All circuits reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry(threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(60_000),
            success_threshold: 2,
        })
    }

    async fn fail(registry: &CircuitBreakerRegistry, key: &str) -> Result<(), HealingError<String>> {
        registry.execute(key, || async { Err::<(), _>("boom".to_string()) }).await
    }

    async fn succeed(registry: &CircuitBreakerRegistry, key: &str) -> Result<(), HealingError<String>> {
        registry.execute(key, || async { Ok::<_, String>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let registry = registry(3);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result = registry
                .execute("svc", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom".to_string())
                })
                .await;
            assert!(matches!(result, Err(HealingError::Operation(_))));
        }
        assert_eq!(registry.state("svc"), CircuitState::Open);

        let result = registry
            .execute("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        match result {
            Err(HealingError::CircuitOpen(err)) => assert_eq!(err.key, "svc"),
            other => panic!("expected circuit open, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failures_in_closed() {
        let registry = registry(3);
        fail(&registry, "svc").await.ok();
        fail(&registry, "svc").await.ok();
        succeed(&registry, "svc").await.ok();
        fail(&registry, "svc").await.ok();

        let snapshot = registry.snapshot("svc").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_then_close() {
        let registry = registry(3);
        for _ in 0..3 {
            fail(&registry, "svc").await.ok();
        }
        assert!(matches!(fail(&registry, "svc").await, Err(HealingError::CircuitOpen(_))));

        tokio::time::advance(Duration::from_millis(60_000)).await;

        assert!(succeed(&registry, "svc").await.is_ok());
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);

        assert!(succeed(&registry, "svc").await.is_ok());
        let snapshot = registry.snapshot("svc").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.consecutive_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let registry = registry(2);
        fail(&registry, "svc").await.ok();
        fail(&registry, "svc").await.ok();

        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert!(matches!(fail(&registry, "svc").await, Err(HealingError::Operation(_))));
        assert_eq!(registry.state("svc"), CircuitState::Open);

        // cool-down restarts from the probe failure
        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(matches!(succeed(&registry, "svc").await, Err(HealingError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_every_concurrent_call() {
        let registry = registry(2);
        fail(&registry, "svc").await.ok();
        fail(&registry, "svc").await.ok();
        tokio::time::advance(Duration::from_millis(60_001)).await;

        // outcomes are not recorded yet, so all four calls are in flight
        for _ in 0..4 {
            assert!(registry.try_acquire("svc").is_ok());
        }
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);

        registry.record_success("svc");
        assert_eq!(registry.state("svc"), CircuitState::HalfOpen);

        registry.record_failure("svc");
        assert_eq!(registry.state("svc"), CircuitState::Open);
        assert!(registry.try_acquire("svc").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_open_before_timeout() {
        let registry = registry(1);
        fail(&registry, "svc").await.ok();
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(matches!(succeed(&registry, "svc").await, Err(HealingError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let registry = registry(1);
        fail(&registry, "db").await.ok();
        assert_eq!(registry.state("db"), CircuitState::Open);
        assert!(succeed(&registry, "storage").await.is_ok());
        assert_eq!(registry.state("storage"), CircuitState::Closed);
        assert_eq!(registry.state("never-seen"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let registry = registry(1);
        fail(&registry, "svc").await.ok();
        registry.reset("svc");
        assert!(registry.snapshot("svc").is_none());
        assert!(succeed(&registry, "svc").await.is_ok());

        fail(&registry, "a").await.ok();
        fail(&registry, "b").await.ok();
        assert_eq!(registry.snapshots().len(), 3);
        registry.reset_all();
        assert!(registry.snapshots().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_trip_once() {
        let registry = Arc::new(registry(5));
        let ran = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let ran = ran.clone();
                tokio::spawn(async move {
                    registry
                        .execute("shared", || async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>("boom".to_string())
                        })
                        .await
                })
            })
            .collect();

        let mut rejected = 0;
        for handle in handles {
            if let Err(HealingError::CircuitOpen(_)) = handle.await.unwrap() {
                rejected += 1;
            }
        }

        let ran = ran.load(Ordering::SeqCst);
        assert_eq!(ran + rejected, 32);
        assert!(ran >= 5);
        let snapshot = registry.snapshot("shared").unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_failures, ran);
    }
}
