//! # Error Classification
//!
//! Sorts failures into a small taxonomy with a retryability bit and a
//! suggested remediation. Rules are checked in priority order and the first
//! category whose tokens appear (case-insensitively) in the failure's message,
//! name or stack wins.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::failure::{AsRawFailure, RawFailure};

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Auth,
    Validation,
    Database,
    Api,
    Ui,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Database => "database",
            ErrorCategory::Api => "api",
            ErrorCategory::Ui => "ui",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Remediation hint attached to every classification in this category
    pub fn suggested_action(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "Retry the request with exponential backoff",
            ErrorCategory::Auth => "Refresh authentication token or re-login",
            ErrorCategory::Validation => "Check input data and fix validation errors",
            ErrorCategory::Database => "Check database constraints and data integrity",
            ErrorCategory::Api => "Retry after a delay or contact API provider",
            ErrorCategory::Ui => "Check component props and state management",
            ErrorCategory::Unknown => "Review error details and investigate",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub subcategory: Option<String>,
    pub is_retryable: bool,
    pub suggested_action: String,
}

const NETWORK_MESSAGE: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "fetch",
    "request failed",
];
const NETWORK_NAME: &[&str] = &["networkerror", "timeouterror"];

const AUTH_MESSAGE: &[&str] = &[
    "auth",
    "unauthorized",
    "forbidden",
    "401",
    "403",
    "token",
    "login",
    "session",
    "expired",
];

const VALIDATION_MESSAGE: &[&str] = &[
    "validation",
    "invalid",
    "required",
    "format",
    "400",
    "zod",
    "schema",
];
const VALIDATION_STACK: &[&str] = &["zod"];

const DATABASE_MESSAGE: &[&str] = &[
    "database",
    "sql",
    "postgres",
    "foreign key",
    "constraint",
    "duplicate",
    "rls",
    "row level security",
    "supabase",
];
const DATABASE_STACK: &[&str] = &["postgrest", "supabase"];

const API_MESSAGE: &[&str] = &["api", "endpoint", "500", "502", "503", "504", "server error"];

const UI_MESSAGE: &[&str] = &[
    "render",
    "component",
    "cannot read",
    "undefined",
    "null",
    "is not a function",
];
const UI_NAME: &[&str] = &["typeerror", "referenceerror"];

/// Lowercased view of a failure, built once per classification
struct Haystack {
    message: String,
    name: String,
    stack: String,
}

impl Haystack {
    fn new(failure: &RawFailure) -> Self {
        Self {
            message: failure.message().to_lowercase(),
            name: failure.name().unwrap_or_default().to_lowercase(),
            stack: failure.stack().unwrap_or_default().to_lowercase(),
        }
    }

    fn message_has(&self, tokens: &[&str]) -> bool {
        contains_any(&self.message, tokens)
    }

    fn name_has(&self, tokens: &[&str]) -> bool {
        contains_any(&self.name, tokens)
    }

    fn stack_has(&self, tokens: &[&str]) -> bool {
        contains_any(&self.stack, tokens)
    }
}

fn contains_any(text: &str, tokens: &[&str]) -> bool {
    !text.is_empty() && tokens.iter().any(|token| text.contains(token))
}

/// Classifies any failure. Never panics.
pub fn classify<F: AsRawFailure + ?Sized>(failure: &F) -> ClassifiedError {
    classify_raw(&failure.to_raw_failure())
}

/// Classifies an already normalized failure
pub fn classify_raw(failure: &RawFailure) -> ClassifiedError {
    let hay = Haystack::new(failure);

    if hay.message_has(NETWORK_MESSAGE) || hay.name_has(NETWORK_NAME) {
        let sub = network_subcategory(&hay.message);
        return classified(ErrorCategory::Network, Some(sub), true);
    }

    if hay.message_has(AUTH_MESSAGE) {
        let retryable = hay.message.contains("expired") || hay.message.contains("token");
        let sub = auth_subcategory(&hay.message);
        return classified(ErrorCategory::Auth, Some(sub), retryable);
    }

    if hay.message_has(VALIDATION_MESSAGE) || hay.stack_has(VALIDATION_STACK) {
        return classified(ErrorCategory::Validation, Some("input_validation"), false);
    }

    if hay.message_has(DATABASE_MESSAGE) || hay.stack_has(DATABASE_STACK) {
        let retryable = !hay.message.contains("constraint") && !hay.message.contains("duplicate");
        let sub = database_subcategory(&hay.message);
        return classified(ErrorCategory::Database, Some(sub), retryable);
    }

    if hay.message_has(API_MESSAGE) {
        let sub = api_subcategory(&hay.message);
        return classified(ErrorCategory::Api, Some(sub), true);
    }

    if hay.message_has(UI_MESSAGE) || hay.name_has(UI_NAME) {
        return classified(ErrorCategory::Ui, Some("rendering"), false);
    }

    classified(ErrorCategory::Unknown, None, false)
}

/// True when the failure falls in the network category; the retry
/// executor's default predicate
pub fn is_network_failure(failure: &RawFailure) -> bool {
    classify_raw(failure).category == ErrorCategory::Network
}

fn classified(category: ErrorCategory, subcategory: Option<&str>, is_retryable: bool) -> ClassifiedError {
    ClassifiedError {
        category,
        subcategory: subcategory.map(str::to_string),
        is_retryable,
        suggested_action: category.suggested_action().to_string(),
    }
}

fn network_subcategory(message: &str) -> &'static str {
    if message.contains("timeout") || message.contains("timed out") {
        "timeout"
    } else if message.contains("connection") {
        "connection"
    } else if message.contains("fetch") {
        "fetch"
    } else {
        "network"
    }
}

fn auth_subcategory(message: &str) -> &'static str {
    if message.contains("token") || message.contains("expired") {
        "token"
    } else if message.contains("unauthorized") {
        "unauthorized"
    } else if message.contains("forbidden") {
        "forbidden"
    } else {
        "authentication"
    }
}

fn database_subcategory(message: &str) -> &'static str {
    if message.contains("foreign key") {
        "foreign_key"
    } else if message.contains("constraint") {
        "constraint"
    } else if message.contains("duplicate") {
        "duplicate"
    } else if message.contains("rls") || message.contains("row level security") {
        "rls"
    } else {
        "database"
    }
}

fn api_subcategory(message: &str) -> &'static str {
    if message.contains("500") {
        "server_error"
    } else if message.contains("502") {
        "bad_gateway"
    } else if message.contains("503") {
        "service_unavailable"
    } else if message.contains("504") {
        "gateway_timeout"
    } else {
        "api"
    }
}
