//! # Error Types
//!
//! Errors surfaced by the resilience layer. Callers of the orchestrator only
//! ever see [`HealingError`], which is either their own operation error or a
//! fast-fail from an open circuit. Setup code (configuration, logging, store
//! construction) uses the crate-level [`Error`].

use thiserror::Error;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while wiring the layer together
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The global tracing subscriber could not be installed
    #[error("Logging initialization error: {0}")]
    Logging(String),

    /// A log store could not be constructed
    #[error("Log store error: {0}")]
    Store(String),

    /// HTTP client failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics exporter could not be installed
    #[error("Metrics error: {0}")]
    Metrics(String),
}

/// Returned when a call is short-circuited by an open breaker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker is OPEN for {key}. Too many failures.")]
pub struct CircuitOpenError {
    /// Key of the circuit that rejected the call
    pub key: String,
}

impl CircuitOpenError {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Outcome of a protected call that did not produce a value
#[derive(Error, Debug)]
pub enum HealingError<E> {
    /// The breaker for the key was open and the operation never ran
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The operation's own error, after any retries
    #[error("{0}")]
    Operation(E),
}

impl<E> HealingError<E> {
    /// Returns true if the call was rejected by an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, HealingError::CircuitOpen(_))
    }

    /// Borrows the operation error, if any
    pub fn operation(&self) -> Option<&E> {
        match self {
            HealingError::Operation(err) => Some(err),
            HealingError::CircuitOpen(_) => None,
        }
    }

    /// Consumes self and returns the operation error, if any
    pub fn into_operation(self) -> Option<E> {
        match self {
            HealingError::Operation(err) => Some(err),
            HealingError::CircuitOpen(_) => None,
        }
    }

    /// Maps the operation error, keeping circuit rejections untouched
    pub fn map_operation<F, U>(self, f: F) -> HealingError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            HealingError::Operation(err) => HealingError::Operation(f(err)),
            HealingError::CircuitOpen(open) => HealingError::CircuitOpen(open),
        }
    }
}
