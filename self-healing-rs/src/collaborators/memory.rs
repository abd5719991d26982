//! In-process collaborators for tests and local runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use async_trait::async_trait;
use uuid::Uuid;

use super::{LogStore, TelemetryEvent, TelemetrySink};
use crate::capture::ErrorLogRecord;
use crate::healing::HealingActionRecord;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log store holding everything in memory. Writes can be switched to fail.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    error_logs: Mutex<Vec<(String, ErrorLogRecord)>>,
    healing_actions: Mutex<Vec<HealingActionRecord>>,
    correlations: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
    fail_correlations: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every insert fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn set_correlation_failing(&self, failing: bool) {
        self.fail_correlations.store(failing, Ordering::SeqCst);
    }

    pub fn error_logs(&self) -> Vec<(String, ErrorLogRecord)> {
        guard(&self.error_logs).clone()
    }

    pub fn healing_actions(&self) -> Vec<HealingActionRecord> {
        guard(&self.healing_actions).clone()
    }

    pub fn correlations(&self) -> Vec<String> {
        guard(&self.correlations).clone()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_error_log(&self, record: &ErrorLogRecord) -> anyhow::Result<String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("log store unavailable");
        }
        let id = Uuid::new_v4().to_string();
        guard(&self.error_logs).push((id.clone(), record.clone()));
        Ok(id)
    }

    async fn insert_healing_action(&self, record: &HealingActionRecord) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("log store unavailable");
        }
        guard(&self.healing_actions).push(record.clone());
        Ok(())
    }

    async fn correlate_bug_report(&self, error_log_id: &str) -> anyhow::Result<()> {
        if self.fail_correlations.load(Ordering::SeqCst) {
            bail!("bug report correlation unavailable");
        }
        guard(&self.correlations).push(error_log_id.to_string());
        Ok(())
    }
}

/// Telemetry sink that records events in memory
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
    user: Mutex<Option<(String, Option<String>)>>,
    failing: AtomicBool,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every call fails, standing in for an unreachable backend
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        guard(&self.events).clone()
    }

    pub fn user(&self) -> Option<(String, Option<String>)> {
        guard(&self.user).clone()
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetry {
    async fn report_exception(&self, event: &TelemetryEvent) -> anyhow::Result<Option<String>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("telemetry unreachable");
        }
        guard(&self.events).push(event.clone());
        Ok(Some(Uuid::new_v4().simple().to_string()))
    }

    async fn set_user(&self, user_id: &str, email: Option<&str>) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("telemetry unreachable");
        }
        *guard(&self.user) = Some((user_id.to_string(), email.map(str::to_string)));
        Ok(())
    }

    async fn clear_user(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("telemetry unreachable");
        }
        *guard(&self.user) = None;
        Ok(())
    }
}
