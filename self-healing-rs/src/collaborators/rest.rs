//! # REST Log Store
//!
//! Log store backed by a PostgREST-style HTTP API: rows are inserted with
//! `POST /rest/v1/<table>` and bug-report correlation is a stored procedure
//! called through `POST /rest/v1/rpc/<function>`.

use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::LogStore;
use crate::capture::ErrorLogRecord;
use crate::healing::HealingActionRecord;
use crate::types::{Error, Result};

/// Connection settings for [`RestLogStore`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestStoreConfig {
    /// Project base URL, e.g. `https://xyz.example.co`
    pub base_url: String,
    /// Key sent both as `apikey` and as the bearer token
    pub api_key: String,
    pub timeout_ms: u64,
    pub error_logs_table: String,
    pub healing_actions_table: String,
    pub bug_report_function: String,
}

impl Default for RestStoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_ms: 10_000,
            error_logs_table: "error_logs".to_string(),
            healing_actions_table: "healing_actions".to_string(),
            bug_report_function: "create_or_update_bug_report".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InsertedRow {
    id: Value,
}

/// HTTP log store
#[derive(Debug, Clone)]
pub struct RestLogStore {
    config: RestStoreConfig,
    client: reqwest::Client,
}

impl RestLogStore {
    pub fn new(config: RestStoreConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::Store("REST log store requires a base_url".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
    }

    async fn check(response: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("{} failed with status {}: {}", what, status, body))
    }
}

#[async_trait]
impl LogStore for RestLogStore {
    async fn insert_error_log(&self, record: &ErrorLogRecord) -> anyhow::Result<String> {
        let payload = json!({
            "error_type": record.error_type,
            "error_message": record.error_message,
            "error_stack": record.error_stack,
            "severity": record.severity,
            "user_id": record.user_id,
            "session_id": record.session_id,
            "page_url": record.page_url,
            "user_agent": record.user_agent,
            "context": record.context,
            "sentry_event_id": record.telemetry_event_id,
        });

        let response = self
            .post(&self.config.error_logs_table)
            .header("Prefer", "return=representation")
            .json(&payload)
            .send()
            .await
            .context("error log insert request")?;
        let response = Self::check(response, "error log insert").await?;

        let rows: Vec<InsertedRow> = response.json().await.context("error log insert response")?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("error log insert returned no rows"))?;

        let id = match row.id {
            Value::String(id) => id,
            other => other.to_string(),
        };
        debug!(error_log_id = %id, "Error log stored");
        Ok(id)
    }

    async fn insert_healing_action(&self, record: &HealingActionRecord) -> anyhow::Result<()> {
        let payload = json!({
            "action_type": record.action_type,
            "action_result": record.action_result,
            "retry_count": record.retry_count,
            "execution_time_ms": record.execution_time_ms,
            "details": {
                "circuit_key": record.circuit_key,
                "error_category": record.error_category,
                "error_message": record.error_message,
            },
        });

        let response = self
            .post(&self.config.healing_actions_table)
            .json(&payload)
            .send()
            .await
            .context("healing action insert request")?;
        Self::check(response, "healing action insert").await?;
        Ok(())
    }

    async fn correlate_bug_report(&self, error_log_id: &str) -> anyhow::Result<()> {
        let path = format!("rpc/{}", self.config.bug_report_function);
        let response = self
            .post(&path)
            .json(&json!({ "p_error_log_id": error_log_id }))
            .send()
            .await
            .context("bug report correlation request")?;
        Self::check(response, "bug report correlation").await?;
        Ok(())
    }
}
