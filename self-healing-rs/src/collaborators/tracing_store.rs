//! Log store that keeps nothing: every record becomes a structured event on
//! the `self_healing::store` target.

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::LogStore;
use crate::capture::ErrorLogRecord;
use crate::healing::HealingActionRecord;

/// Used when no persistent store is configured. Ids are generated locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogStore;

impl TracingLogStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LogStore for TracingLogStore {
    async fn insert_error_log(&self, record: &ErrorLogRecord) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let context = serde_json::to_string(&record.context)?;

        info!(
            target: "self_healing::store",
            error_log_id = %id,
            error_type = %record.error_type,
            error_message = %record.error_message,
            severity = %record.severity,
            session_id = %record.session_id,
            user_id = ?record.user_id,
            page_url = ?record.page_url,
            telemetry_event_id = ?record.telemetry_event_id,
            context = %context,
            "Error log recorded"
        );
        Ok(id)
    }

    async fn insert_healing_action(&self, record: &HealingActionRecord) -> anyhow::Result<()> {
        info!(
            target: "self_healing::store",
            healing_action_id = %record.id,
            action_type = %record.action_type,
            action_result = %record.action_result,
            retry_count = %record.retry_count,
            execution_time_ms = %record.execution_time_ms,
            circuit = %record.circuit_key,
            category = %record.error_category,
            error_message = %record.error_message,
            "Healing action recorded"
        );
        Ok(())
    }

    async fn correlate_bug_report(&self, error_log_id: &str) -> anyhow::Result<()> {
        debug!(
            target: "self_healing::store",
            error_log_id = %error_log_id,
            "No bug report store, correlation skipped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Severity;
    use crate::classifier::ErrorCategory;
    use crate::healing::{ActionResult, ActionType};
    use chrono::Utc;
    use serde_json::Map;

    #[test_log::test(tokio::test)]
    async fn test_records_are_accepted_and_ids_are_unique() {
        let store = TracingLogStore::new();
        let record = ErrorLogRecord {
            error_type: "Error".to_string(),
            error_message: "Network Error".to_string(),
            error_stack: None,
            severity: Severity::Critical,
            user_id: None,
            session_id: "1700000000000-abc123def".to_string(),
            page_url: None,
            user_agent: None,
            context: Map::new(),
            telemetry_event_id: None,
            created_at: Utc::now(),
        };

        let first = store.insert_error_log(&record).await.unwrap();
        let second = store.insert_error_log(&record).await.unwrap();
        assert_ne!(first, second);

        store
            .insert_healing_action(&HealingActionRecord {
                id: Uuid::new_v4(),
                action_type: ActionType::Retry,
                action_result: ActionResult::Failed,
                retry_count: 3,
                execution_time_ms: 7000,
                circuit_key: "backend".to_string(),
                error_category: ErrorCategory::Network,
                error_message: "Network Error".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.correlate_bug_report(&first).await.unwrap();
    }
}
