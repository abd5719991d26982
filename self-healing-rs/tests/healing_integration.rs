//! End-to-end behaviour of the resilience layer through its public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use self_healing::collaborators::{MemoryLogStore, MemoryTelemetry};
use self_healing::config::{CircuitBreakerSettings, RetrySettings};
use self_healing::{
    ActionResult, CaptureContext, CircuitState, ErrorCategory, HealingError, HealingOptions, ResilienceLayer,
    RetryPolicy, Settings, Severity,
};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn settings(failure_threshold: u32) -> Settings {
    Settings {
        circuit_breaker: CircuitBreakerSettings {
            failure_threshold,
            reset_timeout_ms: 60_000,
            success_threshold: 2,
        },
        retry: RetrySettings {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            ..RetrySettings::default()
        },
        ..Settings::default()
    }
}

struct Harness {
    layer: ResilienceLayer,
    store: Arc<MemoryLogStore>,
    telemetry: Arc<MemoryTelemetry>,
}

fn harness(failure_threshold: u32) -> Harness {
    harness_with(failure_threshold, MemoryTelemetry::new())
}

fn harness_with(failure_threshold: u32, telemetry: MemoryTelemetry) -> Harness {
    let store = Arc::new(MemoryLogStore::new());
    let telemetry = Arc::new(telemetry);
    let layer = ResilienceLayer::new(telemetry.clone(), store.clone(), &settings(failure_threshold));
    Harness { layer, store, telemetry }
}

#[test]
fn timeout_is_retryable_network() {
    let layer = harness(5).layer;

    let classified = layer.classify("Request timeout after 30s");
    assert_eq!(classified.category, ErrorCategory::Network);
    assert_eq!(classified.subcategory.as_deref(), Some("timeout"));
    assert!(classified.is_retryable);
}

#[test]
fn constraint_violations_are_not_retryable() {
    let layer = harness(5).layer;

    for message in ["duplicate key value violates unique constraint", "foreign key constraint failed"] {
        let classified = layer.classify(message);
        assert_eq!(classified.category, ErrorCategory::Database, "{}", message);
        assert!(!classified.is_retryable, "{}", message);
    }
}

#[test_log::test(tokio::test)]
async fn threshold_opens_circuit_and_rejects_without_invoking() {
    let layer = harness(3).layer;
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let result = layer
            .circuit_execute("svc", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("upstream 503".to_string())
            })
            .await;
        assert!(matches!(result, Err(HealingError::Operation(_))));
    }
    assert_eq!(layer.breakers().state("svc"), CircuitState::Open);

    let probe = calls.clone();
    let result = layer
        .circuit_execute("svc", move || async move {
            probe.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;

    match result {
        Err(HealingError::CircuitOpen(e)) => {
            assert_eq!(e.key, "svc");
            assert_eq!(e.to_string(), "Circuit breaker is OPEN for svc. Too many failures.");
        }
        other => panic!("expected an open circuit, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn half_open_probe_closes_after_two_successes() {
    let layer = harness(3).layer;

    for _ in 0..3 {
        let _ = layer
            .circuit_execute("svc", || async { Err::<(), _>("upstream 503".to_string()) })
            .await;
    }
    assert_eq!(layer.breakers().state("svc"), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(60_001)).await;

    assert_ok!(layer.circuit_execute("svc", || async { Ok::<_, String>(1) }).await);
    assert_eq!(layer.breakers().state("svc"), CircuitState::HalfOpen);

    assert_ok!(layer.circuit_execute("svc", || async { Ok::<_, String>(2) }).await);
    let snapshot = layer.breakers().snapshot("svc").expect("circuit exists");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.consecutive_successes, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_backs_off_exponentially() {
    let layer = harness(5).layer;
    let calls = Arc::new(AtomicU32::new(0));
    let observed = Arc::new(Mutex::new(Vec::new()));

    let seen = observed.clone();
    let policy = RetryPolicy::default()
        .max_retries(2)
        .initial_delay(Duration::from_millis(1000))
        .backoff_multiplier(2.0)
        .on_retry(move |attempt, _| seen.lock().unwrap().push(attempt));

    let started = Instant::now();
    let counter = calls.clone();
    let result = layer
        .retry_execute(
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(format!("network error on attempt {}", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            Some(policy),
        )
        .await;

    assert_eq!(result, Ok(3));
    assert_eq!(*observed.lock().unwrap(), vec![1, 2]);
    assert!(started.elapsed() >= Duration::from_millis(3000));
}

#[tokio::test(start_paused = true)]
async fn fallback_returned_with_single_failed_record() {
    let Harness { layer, store, .. } = harness(5);

    let result = layer
        .self_heal(
            || async { Err::<i32, _>("Failed to fetch".to_string()) },
            HealingOptions::new().fallback(42),
        )
        .await;

    assert_eq!(result.unwrap(), 42);

    let records = store.healing_actions();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action_result, ActionResult::Failed);
}

#[tokio::test]
async fn open_circuit_skips_retry_and_operation() {
    let Harness { layer, .. } = harness(1);

    let _ = layer
        .self_heal(
            || async { Err::<(), _>("invalid payload".to_string()) },
            HealingOptions::new().circuit_key("storage"),
        )
        .await;
    assert_eq!(layer.breakers().state("storage"), CircuitState::Open);

    let calls = Arc::new(AtomicU32::new(0));
    let retries = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let observer = retries.clone();

    let result = layer
        .self_heal(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("network down".to_string()) }
            },
            HealingOptions::new().circuit_key("storage").retry_policy(
                RetryPolicy::default().on_retry(move |_, _| {
                    observer.fetch_add(1, Ordering::SeqCst);
                }),
            ),
        )
        .await;

    assert!(assert_err!(result).is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn capture_network_error_is_critical() {
    let Harness { layer, store, telemetry } = harness(5);

    let id = layer.capture_error("Network Error", CaptureContext::new()).await;

    assert!(id.is_some());
    assert_eq!(store.error_logs()[0].1.severity, Severity::Critical);
    assert_eq!(telemetry.events()[0].severity, Severity::Critical);
}

#[tokio::test]
async fn capture_survives_failing_telemetry() {
    let Harness { layer, store, .. } = harness_with(5, MemoryTelemetry::failing());

    let id = layer.capture_error("Network Error", CaptureContext::new()).await;

    assert!(id.is_some());
    let logs = store.error_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].1.telemetry_event_id.is_none());
}

#[tokio::test]
async fn capture_returns_none_when_store_is_down() {
    let Harness { layer, store, .. } = harness(5);
    store.set_failing(true);

    assert!(layer
        .capture_error("Network Error", CaptureContext::new().component("Gallery"))
        .await
        .is_none());
}
