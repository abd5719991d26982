//! # Self-Healing Resilience Layer
//!
//! Wraps fallible remote calls (database queries, storage uploads, RPC calls)
//! so that they fail predictably:
//!
//! - error classification into coarse categories with a retryability verdict
//! - sequential retries with capped exponential backoff
//! - per-key circuit breakers that fail fast while a dependency is down
//! - an orchestrator combining both with an optional fallback value
//! - a best-effort capture pipeline reporting failures to telemetry and a
//!   log store
//!
//! ```no_run
//! use self_healing::{HealingOptions, ResilienceLayer, Settings};
//!
//! # async fn run() -> self_healing::Result<()> {
//! let settings = Settings::load()?;
//! let (layer, _guard) = self_healing::init(&settings)?;
//!
//! let listings = layer
//!     .self_heal(
//!         || async { Err::<Vec<String>, _>("Failed to fetch".to_string()) },
//!         HealingOptions::new().circuit_key("listings").fallback(Vec::new()),
//!     )
//!     .await;
//! assert!(listings.is_ok());
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod circuit_breaker;
pub mod classifier;
pub mod collaborators;
pub mod config;
pub mod failure;
pub mod healing;
pub mod layer;
pub mod logging;
pub mod monitoring;
pub mod retry;
pub mod sanitization;
pub mod types;

// Re-export commonly used types
pub use capture::{CaptureConfig, CaptureContext, ErrorCapture, ErrorLogRecord, Severity};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use classifier::{classify, ClassifiedError, ErrorCategory};
pub use collaborators::{LogStore, TelemetryEvent, TelemetrySink};
pub use crate::config::Settings;
pub use failure::{AsRawFailure, NormalizedFailure, RawFailure};
pub use healing::{
    ActionResult, ActionType, HealingActionRecord, HealingOptions, QueryError, QueryResponse, SelfHealing,
};
pub use layer::ResilienceLayer;
pub use logging::{init_logging, LoggingConfig};
pub use retry::{retry_execute, RetryExecutor, RetryOn, RetryPolicy};
pub use types::{CircuitOpenError, Error, HealingError, Result};

use tracing_appender::non_blocking::WorkerGuard;

/// Installs logging and metrics, then builds the layer from `settings`.
///
/// Must be called inside a Tokio runtime when a Prometheus listen address is
/// configured. Keep the returned guard alive to flush file logs.
pub fn init(settings: &Settings) -> Result<(ResilienceLayer, Option<WorkerGuard>)> {
    let guard = init_logging(&settings.logging)?;
    monitoring::init_metrics(&settings.metrics)?;
    let layer = ResilienceLayer::from_settings(settings)?;
    Ok((layer, guard))
}
