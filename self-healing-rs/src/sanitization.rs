//! # Sanitization
//!
//! Strips credentials from capture context before it is persisted, and
//! redacts credential-looking fragments from free text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Context keys dropped at the top level and inside `data`
pub const SENSITIVE_KEYS: &[&str] = &["password", "token", "apiKey", "api_key", "secret"];

/// Nested object whose keys are also scrubbed
const DATA_FIELD: &str = "data";

const REDACTED: &str = "[REDACTED]";

// (pattern, replacement) applied in order
static SENSITIVE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        // OAuth bearer tokens
        (
            Regex::new(r"(?i)\b(bearer)\s+[a-z0-9._\-]+").expect("bearer pattern"),
            "${1} [REDACTED]",
        ),
        // JWTs
        (
            Regex::new(r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+").expect("jwt pattern"),
            REDACTED,
        ),
        // key=value credentials
        (
            Regex::new(
                r#"(?i)\b(api[_-]?key|access[_-]?token|refresh[_-]?token|token|secret|password|passwd)(["']?\s*[=:]\s*["']?)[^"'\s,;&]+"#,
            )
            .expect("credential pattern"),
            "${1}${2}[REDACTED]",
        ),
    ]
});

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.contains(&key)
}

/// Returns a copy of `context` without sensitive keys at the top level or
/// one level down under `data`
pub fn sanitize_context(context: &Map<String, Value>) -> Map<String, Value> {
    context
        .iter()
        .filter(|(key, _)| !is_sensitive_key(key))
        .map(|(key, value)| {
            let value = match (key.as_str(), value) {
                (DATA_FIELD, Value::Object(data)) => Value::Object(
                    data.iter()
                        .filter(|(k, _)| !is_sensitive_key(k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ),
                _ => value.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Redacts credential fragments in free text
pub fn redact_message(message: &str) -> String {
    SENSITIVE_PATTERNS
        .iter()
        .fold(message.to_string(), |text, (pattern, replacement)| {
            pattern.replace_all(&text, *replacement).into_owned()
        })
}

/// Redacts credential fragments in every string of a JSON value
pub fn redact_value(value: &mut Value) {
    match value {
        Value::String(text) => *text = redact_message(text),
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        Value::Object(map) => map.values_mut().for_each(redact_value),
        _ => {}
    }
}
