//! Telemetry sink that turns exceptions into structured tracing events.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{TelemetryEvent, TelemetrySink};
use crate::capture::Severity;

/// Writes each exception to the `self_healing::telemetry` target and hands
/// back a generated event id
#[derive(Debug, Default)]
pub struct TracingTelemetry {
    user: RwLock<Option<String>>,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn report_exception(&self, event: &TelemetryEvent) -> anyhow::Result<Option<String>> {
        let event_id = Uuid::new_v4().simple().to_string();
        let user = self
            .user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        let context = serde_json::to_string(&event.context)?;
        let tags = event
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        match event.severity {
            Severity::Critical | Severity::High => error!(
                target: "self_healing::telemetry",
                event_id = %event_id,
                telemetry_level = %event.severity.telemetry_level(),
                error_type = %event.failure.name,
                error_message = %event.failure.message,
                user = %user,
                tags = %tags,
                context = %context,
                "Exception captured"
            ),
            Severity::Medium => warn!(
                target: "self_healing::telemetry",
                event_id = %event_id,
                telemetry_level = %event.severity.telemetry_level(),
                error_type = %event.failure.name,
                error_message = %event.failure.message,
                user = %user,
                tags = %tags,
                context = %context,
                "Exception captured"
            ),
            Severity::Low => info!(
                target: "self_healing::telemetry",
                event_id = %event_id,
                telemetry_level = %event.severity.telemetry_level(),
                error_type = %event.failure.name,
                error_message = %event.failure.message,
                user = %user,
                tags = %tags,
                context = %context,
                "Exception captured"
            ),
        }

        Ok(Some(event_id))
    }

    async fn set_user(&self, user_id: &str, _email: Option<&str>) -> anyhow::Result<()> {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id.to_string());
        Ok(())
    }

    async fn clear_user(&self) -> anyhow::Result<()> {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
