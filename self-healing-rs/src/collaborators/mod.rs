//! # External Collaborators
//!
//! The layer reports to two outside systems: a telemetry sink (exception
//! tracking) and a log store (error logs, healing actions, bug-report
//! correlation). Both are traits so callers can plug in their backend; every
//! call is best-effort from the layer's point of view.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::capture::{ErrorLogRecord, Severity};
use crate::failure::NormalizedFailure;
use crate::healing::HealingActionRecord;

pub mod memory;
pub mod rest;
pub mod telemetry;
pub mod tracing_store;

pub use memory::{MemoryLogStore, MemoryTelemetry};
pub use rest::{RestLogStore, RestStoreConfig};
pub use telemetry::TracingTelemetry;
pub use tracing_store::TracingLogStore;

/// A failure report handed to the telemetry sink
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub failure: NormalizedFailure,
    pub severity: Severity,
    /// Caller context after sanitization
    pub context: Map<String, Value>,
    pub tags: Vec<(String, String)>,
}

/// Exception tracking backend
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Reports an exception and returns the backend's event id, if it has one
    async fn report_exception(&self, event: &TelemetryEvent) -> anyhow::Result<Option<String>>;

    /// Tags subsequent events with a user
    async fn set_user(&self, user_id: &str, email: Option<&str>) -> anyhow::Result<()>;

    async fn clear_user(&self) -> anyhow::Result<()>;
}

/// Persistence for error logs and healing actions
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Stores an error log and returns its id
    async fn insert_error_log(&self, record: &ErrorLogRecord) -> anyhow::Result<String>;

    async fn insert_healing_action(&self, record: &HealingActionRecord) -> anyhow::Result<()>;

    /// Creates or updates the bug report grouping this error log
    async fn correlate_bug_report(&self, error_log_id: &str) -> anyhow::Result<()>;
}
