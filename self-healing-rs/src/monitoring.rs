//! Metric names emitted by the layer and the optional Prometheus exporter.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::MetricsConfig;
use crate::types::{Error, Result};

pub const RETRY_ATTEMPTS: &str = "self_healing.retry.attempts";
pub const RETRY_EXHAUSTED: &str = "self_healing.retry.exhausted";
pub const RETRY_SUCCESS_AFTER_RETRY: &str = "self_healing.retry.success_after_retry";
pub const RETRY_DELAY_MS: &str = "self_healing.retry.delay_ms";

pub const CIRCUIT_STATE: &str = "self_healing.circuit.state";
pub const CIRCUIT_OPENED: &str = "self_healing.circuit.opened";
pub const CIRCUIT_HALF_OPENED: &str = "self_healing.circuit.half_opened";
pub const CIRCUIT_CLOSED: &str = "self_healing.circuit.closed";
pub const CIRCUIT_REJECTED: &str = "self_healing.circuit.rejected";

pub const HEALING_ACTIONS: &str = "self_healing.healing.actions";
pub const HEALING_FALLBACKS: &str = "self_healing.healing.fallbacks";
pub const HEALING_PERSIST_FAILURES: &str = "self_healing.healing.persist_failures";

pub const CAPTURED_ERRORS: &str = "self_healing.capture.errors";
pub const CAPTURE_TELEMETRY_FAILURES: &str = "self_healing.capture.telemetry_failures";
pub const CAPTURE_STORE_FAILURES: &str = "self_healing.capture.store_failures";

/// Installs the global Prometheus recorder when a listen address is set.
/// Must be called from within a Tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<bool> {
    let Some(listen) = config.prometheus_listen.as_deref() else {
        return Ok(false);
    };

    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| Error::Metrics(format!("invalid listen address {}: {}", listen, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::Metrics(e.to_string()))?;

    info!(listen = %addr, "Prometheus exporter installed");
    Ok(true)
}
