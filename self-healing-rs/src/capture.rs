//! # Error Capture
//!
//! Best-effort pipeline that turns a failure into an error log:
//!
//! 1. normalize the failure to `{name, message, stack}`
//! 2. pick a severity
//! 3. sanitize the caller's context
//! 4. report to the telemetry sink, keeping its event id
//! 5. persist an [`ErrorLogRecord`], falling back to a local log line
//! 6. correlate the stored log with a bug report on a detached task
//!
//! No step can fail the caller; [`ErrorCapture::capture`] returns the stored
//! log id or `None`.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::collaborators::{LogStore, TelemetryEvent, TelemetrySink};
use crate::failure::{AsRawFailure, NormalizedFailure};
use crate::monitoring::{CAPTURED_ERRORS, CAPTURE_STORE_FAILURES, CAPTURE_TELEMETRY_FAILURES};
use crate::sanitization::{redact_message, redact_value, sanitize_context};

/// Error log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Level name used by exception trackers
    pub fn telemetry_level(&self) -> &'static str {
        match self {
            Severity::Critical => "fatal",
            Severity::High => "error",
            Severity::Medium => "warning",
            Severity::Low => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied context for a captured failure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureContext {
    /// Overrides the severity heuristic when it does not match anything
    /// more severe
    pub severity: Option<Severity>,
    pub component: Option<String>,
    pub action: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub page_url: Option<String>,
    pub user_agent: Option<String>,
    /// Free-form fields; `data` is scrubbed one level deep
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CaptureContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn page_url(mut self, page_url: impl Into<String>) -> Self {
        self.page_url = Some(page_url.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Flattens the context into the JSON object stored with the log
    fn to_map(&self) -> Map<String, Value> {
        let mut map = self.fields.clone();
        let typed = [
            ("severity", self.severity.map(|s| s.as_str().to_string())),
            ("component", self.component.clone()),
            ("action", self.action.clone()),
            ("userId", self.user_id.clone()),
            ("sessionId", self.session_id.clone()),
            ("pageUrl", self.page_url.clone()),
            ("userAgent", self.user_agent.clone()),
        ];
        for (key, value) in typed {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::String(value));
            }
        }
        map
    }
}

/// Persisted error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogRecord {
    pub error_type: String,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub session_id: String,
    pub page_url: Option<String>,
    pub user_agent: Option<String>,
    pub context: Map<String, Value>,
    pub telemetry_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Settings for [`ErrorCapture`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Used when the context carries no page URL
    pub default_page_url: Option<String>,
    /// Used when the context carries no user agent
    pub user_agent: Option<String>,
    /// Capture a backtrace for failures that arrive without a stack
    pub attach_backtrace: bool,
    /// Redact credential fragments in messages and context strings
    pub redact_secrets: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_page_url: None,
            user_agent: None,
            attach_backtrace: false,
            redact_secrets: true,
        }
    }
}

/// Picks a severity: critical, then high, then low, else medium. An explicit
/// severity in the context takes part at its own tier.
pub fn determine_severity(failure: &NormalizedFailure, explicit: Option<Severity>) -> Severity {
    let name = failure.name.to_lowercase();
    let message = failure.message.to_lowercase();

    if name.contains("chunk")
        || name.contains("loading")
        || message.contains("network error")
        || message.contains("failed to fetch")
        || explicit == Some(Severity::Critical)
    {
        return Severity::Critical;
    }

    if name.contains("typeerror")
        || name.contains("referenceerror")
        || message.contains("unauthorized")
        || message.contains("forbidden")
        || explicit == Some(Severity::High)
    {
        return Severity::High;
    }

    if name.contains("warning") || message.contains("validation") || explicit == Some(Severity::Low) {
        return Severity::Low;
    }

    Severity::Medium
}

/// `<unix millis>-<9 random chars>`
fn new_session_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}

/// The capture pipeline. One instance per process session.
pub struct ErrorCapture {
    telemetry: Arc<dyn TelemetrySink>,
    store: Arc<dyn LogStore>,
    config: CaptureConfig,
    session_id: String,
    current_user: RwLock<Option<String>>,
}

impl fmt::Debug for ErrorCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorCapture")
            .field("config", &self.config)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ErrorCapture {
    pub fn new(telemetry: Arc<dyn TelemetrySink>, store: Arc<dyn LogStore>, config: CaptureConfig) -> Self {
        Self {
            telemetry,
            store,
            config,
            session_id: new_session_id(),
            current_user: RwLock::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_user(&self) -> Option<String> {
        self.current_user.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Captures a failure. Returns the stored error log id, or `None` when
    /// it could not be persisted.
    pub async fn capture<F: AsRawFailure + ?Sized>(&self, failure: &F, context: CaptureContext) -> Option<String> {
        let mut normalized = failure.to_raw_failure().normalize();
        if self.config.attach_backtrace && normalized.stack.is_none() {
            normalized.stack = Some(format!("{:?}", backtrace::Backtrace::new()));
        }

        let severity = determine_severity(&normalized, context.severity);
        counter!(CAPTURED_ERRORS, 1, "severity" => severity.as_str());

        if self.config.redact_secrets {
            normalized.message = redact_message(&normalized.message);
        }
        let mut sanitized = sanitize_context(&context.to_map());
        if self.config.redact_secrets {
            sanitized.values_mut().for_each(redact_value);
        }

        let telemetry_event_id = self.report(&normalized, severity, &context, &sanitized).await;

        let record = ErrorLogRecord {
            error_type: normalized.name.clone(),
            error_message: normalized.message.clone(),
            error_stack: normalized.stack.clone(),
            severity,
            user_id: self.current_user().or_else(|| context.user_id.clone()),
            session_id: context.session_id.clone().unwrap_or_else(|| self.session_id.clone()),
            page_url: context.page_url.clone().or_else(|| self.config.default_page_url.clone()),
            user_agent: context.user_agent.clone().or_else(|| self.config.user_agent.clone()),
            context: sanitized,
            telemetry_event_id,
            created_at: Utc::now(),
        };

        let id = match self.store.insert_error_log(&record).await {
            Ok(id) => id,
            Err(e) => {
                counter!(CAPTURE_STORE_FAILURES, 1);
                error!(
                    target: "self_healing::fallback",
                    error_type = %record.error_type,
                    error_message = %record.error_message,
                    severity = %record.severity,
                    session_id = %record.session_id,
                    store_error = %e,
                    "Failed to persist error log"
                );
                return None;
            }
        };

        self.spawn_bug_report(id.clone());
        Some(id)
    }

    async fn report(
        &self,
        failure: &NormalizedFailure,
        severity: Severity,
        context: &CaptureContext,
        sanitized: &Map<String, Value>,
    ) -> Option<String> {
        let mut tags = vec![("severity".to_string(), severity.as_str().to_string())];
        if let Some(component) = &context.component {
            tags.push(("component".to_string(), component.clone()));
        }
        if let Some(action) = &context.action {
            tags.push(("action".to_string(), action.clone()));
        }
        tags.push(("session_id".to_string(), self.session_id.clone()));

        let event = TelemetryEvent {
            failure: failure.clone(),
            severity,
            context: sanitized.clone(),
            tags,
        };

        match self.telemetry.report_exception(&event).await {
            Ok(event_id) => event_id,
            Err(e) => {
                counter!(CAPTURE_TELEMETRY_FAILURES, 1);
                warn!(error = %e, "Failed to report exception to telemetry");
                None
            }
        }
    }

    /// Correlates on a detached task; skipped when no Tokio runtime is
    /// driving the capture
    fn spawn_bug_report(&self, error_log_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(error_log_id = %error_log_id, "No Tokio runtime, skipping bug report correlation");
            return;
        };

        let store = Arc::clone(&self.store);
        runtime.spawn(async move {
            if let Err(e) = store.correlate_bug_report(&error_log_id).await {
                debug!(error_log_id = %error_log_id, error = %e, "Bug report correlation failed");
            }
        });
    }

    /// Tags future captures and telemetry events with a user
    pub async fn set_user(&self, user_id: &str, email: Option<&str>) {
        *self.current_user.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id.to_string());
        if let Err(e) = self.telemetry.set_user(user_id, email).await {
            debug!(error = %e, "Failed to set telemetry user");
        }
    }

    pub async fn clear_user(&self) {
        *self.current_user.write().unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(e) = self.telemetry.clear_user().await {
            debug!(error = %e, "Failed to clear telemetry user");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryLogStore, MemoryTelemetry};
    use crate::failure::RawFailure;
    use serde_json::json;

    fn pipeline(telemetry: Arc<MemoryTelemetry>, store: Arc<MemoryLogStore>) -> ErrorCapture {
        ErrorCapture::new(telemetry, store, CaptureConfig::default())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn severity_of(failure: RawFailure, explicit: Option<Severity>) -> Severity {
        determine_severity(&failure.normalize(), explicit)
    }

    #[test]
    fn test_severity_tiers() {
        assert_eq!(severity_of(RawFailure::from_message("Network Error"), None), Severity::Critical);
        assert_eq!(
            severity_of(RawFailure::typed("ChunkLoadError", "Loading chunk 7 failed"), None),
            Severity::Critical
        );
        assert_eq!(severity_of(RawFailure::typed("TypeError", "x is undefined"), None), Severity::High);
        assert_eq!(severity_of(RawFailure::from_message("403 Forbidden"), None), Severity::High);
        assert_eq!(severity_of(RawFailure::from_message("validation failed"), None), Severity::Low);
        assert_eq!(severity_of(RawFailure::from_message("odd"), None), Severity::Medium);
    }

    #[test]
    fn test_explicit_severity_respects_tier_order() {
        assert_eq!(
            severity_of(RawFailure::from_message("odd"), Some(Severity::Low)),
            Severity::Low
        );
        // heuristics for a higher tier still win over an explicit low
        assert_eq!(
            severity_of(RawFailure::from_message("Network Error"), Some(Severity::Low)),
            Severity::Critical
        );
        assert_eq!(
            severity_of(RawFailure::from_message("odd"), Some(Severity::Medium)),
            Severity::Medium
        );
    }

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
    }

    #[tokio::test]
    async fn test_capture_persists_and_correlates() {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let store = Arc::new(MemoryLogStore::new());
        let capture = pipeline(telemetry.clone(), store.clone());

        let context = CaptureContext::new()
            .component("PropertyForm")
            .action("save")
            .page_url("/properties/new")
            .field("password", "hunter2")
            .field("data", json!({ "title": "Loft", "token": "t" }));

        let id = capture
            .capture(&RawFailure::typed("TypeError", "x is undefined"), context)
            .await
            .expect("log id");

        let logs = store.error_logs();
        assert_eq!(logs.len(), 1);
        let (stored_id, record) = &logs[0];
        assert_eq!(stored_id, &id);
        assert_eq!(record.error_type, "TypeError");
        assert_eq!(record.severity, Severity::High);
        assert_eq!(record.session_id, capture.session_id());
        assert_eq!(record.page_url.as_deref(), Some("/properties/new"));
        assert_eq!(record.context["component"], "PropertyForm");
        assert!(!record.context.contains_key("password"));
        assert!(!record.context["data"].as_object().unwrap().contains_key("token"));

        let events = telemetry.events();
        assert_eq!(events.len(), 1);
        assert!(record.telemetry_event_id.is_some());
        assert!(events[0].tags.contains(&("component".to_string(), "PropertyForm".to_string())));
        assert!(!events[0].context.contains_key("password"));

        settle().await;
        assert_eq!(store.correlations(), vec![id]);
    }

    #[tokio::test]
    async fn test_telemetry_failure_still_persists() {
        let store = Arc::new(MemoryLogStore::new());
        let capture = pipeline(Arc::new(MemoryTelemetry::failing()), store.clone());

        let id = capture.capture("Network Error", CaptureContext::new()).await;

        assert!(id.is_some());
        let logs = store.error_logs();
        assert_eq!(logs[0].1.severity, Severity::Critical);
        assert!(logs[0].1.telemetry_event_id.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_returns_none() {
        let store = Arc::new(MemoryLogStore::new());
        store.set_failing(true);
        let capture = pipeline(Arc::new(MemoryTelemetry::new()), store.clone());

        assert!(capture.capture("boom", CaptureContext::new()).await.is_none());
        settle().await;
        assert!(store.correlations().is_empty());
    }

    #[tokio::test]
    async fn test_correlation_failure_is_swallowed() {
        let store = Arc::new(MemoryLogStore::new());
        store.set_correlation_failing(true);
        let capture = pipeline(Arc::new(MemoryTelemetry::new()), store.clone());

        assert!(capture.capture("boom", CaptureContext::new()).await.is_some());
        settle().await;
        assert!(store.correlations().is_empty());
    }

    #[test]
    fn test_capture_without_tokio_runtime() {
        let store = Arc::new(MemoryLogStore::new());
        let capture = pipeline(Arc::new(MemoryTelemetry::new()), store.clone());

        let id = futures::executor::block_on(capture.capture("boom", CaptureContext::new()));

        assert!(id.is_some());
        assert_eq!(store.error_logs().len(), 1);
        assert!(store.correlations().is_empty());
    }

    #[tokio::test]
    async fn test_user_tagging() {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let store = Arc::new(MemoryLogStore::new());
        let capture = pipeline(telemetry.clone(), store.clone());

        capture.set_user("user-7", Some("agent@example.com")).await;
        capture.set_user("user-7", Some("agent@example.com")).await;
        assert_eq!(
            telemetry.user(),
            Some(("user-7".to_string(), Some("agent@example.com".to_string())))
        );

        capture.capture("boom", CaptureContext::new().user_id("ignored")).await;
        assert_eq!(store.error_logs()[0].1.user_id.as_deref(), Some("user-7"));

        capture.clear_user().await;
        capture.clear_user().await;
        assert!(telemetry.user().is_none());

        capture.capture("boom", CaptureContext::new().user_id("from-context")).await;
        assert_eq!(store.error_logs()[1].1.user_id.as_deref(), Some("from-context"));
    }

    #[tokio::test]
    async fn test_message_secrets_redacted() {
        let store = Arc::new(MemoryLogStore::new());
        let capture = pipeline(Arc::new(MemoryTelemetry::new()), store.clone());

        capture
            .capture("upload rejected: api_key=abc123", CaptureContext::new())
            .await;
        assert_eq!(store.error_logs()[0].1.error_message, "upload rejected: api_key=[REDACTED]");
    }

    #[tokio::test]
    async fn test_backtrace_attached_when_configured() {
        let store = Arc::new(MemoryLogStore::new());
        let config = CaptureConfig {
            attach_backtrace: true,
            ..CaptureConfig::default()
        };
        let capture = ErrorCapture::new(Arc::new(MemoryTelemetry::new()), store.clone(), config);

        capture.capture("boom", CaptureContext::new()).await;
        assert!(store.error_logs()[0].1.error_stack.is_some());
    }
}
