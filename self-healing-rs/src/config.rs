//! # Configuration
//!
//! Settings are read from an optional `config/self-healing.{toml,yaml,json}`
//! file and then from `SELF_HEALING__*` environment variables, for example
//! `SELF_HEALING__RETRY__MAX_RETRIES=5` or
//! `SELF_HEALING__STORE__BASE_URL=https://...`. A `.env` file is loaded
//! first when present. Durations are in milliseconds.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::collaborators::RestStoreConfig;
use crate::logging::LoggingConfig;
use crate::retry::{RetryOn, RetryPolicy};
use crate::types::Result;

pub const DEFAULT_CONFIG_FILE: &str = "config/self-healing";
pub const ENV_PREFIX: &str = "SELF_HEALING";

/// Everything needed to build a [`crate::ResilienceLayer`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub capture: CaptureConfig,
    /// REST log store; records are only logged when absent
    pub store: Option<RestStoreConfig>,
    pub metrics: MetricsConfig,
}

/// Default retry policy for the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    /// Message patterns to retry on; empty means network failures
    pub retry_patterns: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            retry_patterns: Vec::new(),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy::default()
            .max_retries(settings.max_retries)
            .initial_delay(Duration::from_millis(settings.initial_delay_ms))
            .max_delay(Duration::from_millis(settings.max_delay_ms))
            .backoff_multiplier(settings.backoff_multiplier)
            .jitter_factor(settings.jitter_factor)
            .retry_on(RetryOn::patterns(settings.retry_patterns.iter().cloned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            success_threshold: 2,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
            success_threshold: settings.success_threshold,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Socket address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9000`
    pub prometheus_listen: Option<String>,
}

impl TryFrom<Config> for Settings {
    type Error = config::ConfigError;

    fn try_from(cfg: Config) -> std::result::Result<Self, Self::Error> {
        cfg.try_deserialize()
    }
}

impl Settings {
    /// Loads `.env`, then [`DEFAULT_CONFIG_FILE`], then the environment
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Loads from `path` (extension optional, file optional) and the
    /// environment
    pub fn load_from(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(Settings::try_from(cfg)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from(&self.circuit_breaker)
    }
}
