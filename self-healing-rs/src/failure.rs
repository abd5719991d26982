//! # Failure Normalization
//!
//! Every failure entering the layer is reduced to a [`RawFailure`] before it
//! is classified, retried on or captured. Caller error types opt in through
//! [`AsRawFailure`].

use std::error::Error as StdError;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::types::{CircuitOpenError, HealingError};

/// Name given to failures that carry no type name of their own
pub const GENERIC_ERROR_NAME: &str = "Error";

/// A failure as seen by the classifier: a bare message, or a typed error
/// with a name and an optional stack/cause chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    /// Plain message with no type information
    Message(String),
    /// Structured error
    Typed {
        name: String,
        message: String,
        stack: Option<String>,
    },
}

impl RawFailure {
    pub fn from_message(message: impl Into<String>) -> Self {
        RawFailure::Message(message.into())
    }

    pub fn typed(name: impl Into<String>, message: impl Into<String>) -> Self {
        RawFailure::Typed {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attaches a stack, promoting a bare message to a typed failure
    pub fn with_stack(self, stack: impl Into<String>) -> Self {
        match self {
            RawFailure::Message(message) => RawFailure::Typed {
                name: GENERIC_ERROR_NAME.to_string(),
                message,
                stack: Some(stack.into()),
            },
            RawFailure::Typed { name, message, .. } => RawFailure::Typed {
                name,
                message,
                stack: Some(stack.into()),
            },
        }
    }

    /// Builds a typed failure from any std error, using its source chain
    /// as the stack
    pub fn from_error(name: &str, err: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        RawFailure::Typed {
            name: name.to_string(),
            message: err.to_string(),
            stack: if chain.is_empty() { None } else { Some(chain.join("\n")) },
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            RawFailure::Message(_) => None,
            RawFailure::Typed { name, .. } => Some(name),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RawFailure::Message(message) => message,
            RawFailure::Typed { message, .. } => message,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            RawFailure::Message(_) => None,
            RawFailure::Typed { stack, .. } => stack.as_deref(),
        }
    }

    pub fn normalize(&self) -> NormalizedFailure {
        NormalizedFailure {
            name: self.name().unwrap_or(GENERIC_ERROR_NAME).to_string(),
            message: self.message().to_string(),
            stack: self.stack().map(str::to_string),
        }
    }
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawFailure::Message(message) => write!(f, "{}", message),
            RawFailure::Typed { name, message, .. } => write!(f, "{}: {}", name, message),
        }
    }
}

impl StdError for RawFailure {}

/// Failure shape persisted and forwarded to telemetry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedFailure {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

/// Conversion of caller error types into the classifier's view
pub trait AsRawFailure {
    fn to_raw_failure(&self) -> RawFailure;
}

impl<T: AsRawFailure + ?Sized> AsRawFailure for &T {
    fn to_raw_failure(&self) -> RawFailure {
        (**self).to_raw_failure()
    }
}

impl AsRawFailure for RawFailure {
    fn to_raw_failure(&self) -> RawFailure {
        self.clone()
    }
}

impl AsRawFailure for str {
    fn to_raw_failure(&self) -> RawFailure {
        RawFailure::from_message(self)
    }
}

impl AsRawFailure for String {
    fn to_raw_failure(&self) -> RawFailure {
        RawFailure::from_message(self.as_str())
    }
}

impl AsRawFailure for io::Error {
    fn to_raw_failure(&self) -> RawFailure {
        let name = match self.kind() {
            io::ErrorKind::TimedOut => "TimeoutError",
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::AddrNotAvailable => "NetworkError",
            _ => "IoError",
        };
        RawFailure::from_error(name, self)
    }
}

impl AsRawFailure for reqwest::Error {
    fn to_raw_failure(&self) -> RawFailure {
        let name = if self.is_timeout() {
            "TimeoutError"
        } else if self.is_connect() || self.is_request() {
            "NetworkError"
        } else if self.is_status() {
            "HttpError"
        } else if self.is_decode() || self.is_body() {
            "DecodeError"
        } else {
            "NetworkError"
        };

        let failure = RawFailure::from_error(name, self);
        match self.status() {
            // status text like "503 Service Unavailable" keeps the api rules working
            Some(status) if !failure.message().contains(status.as_str()) => {
                let stack = failure.stack().map(str::to_string);
                RawFailure::Typed {
                    name: name.to_string(),
                    message: format!("{} ({})", failure.message(), status),
                    stack,
                }
            }
            _ => failure,
        }
    }
}

impl AsRawFailure for serde_json::Error {
    fn to_raw_failure(&self) -> RawFailure {
        RawFailure::from_error("SerializationError", self)
    }
}

impl AsRawFailure for tokio::time::error::Elapsed {
    fn to_raw_failure(&self) -> RawFailure {
        RawFailure::typed("TimeoutError", self.to_string())
    }
}

impl AsRawFailure for Box<dyn StdError + Send + Sync> {
    fn to_raw_failure(&self) -> RawFailure {
        if let Some(raw) = self.downcast_ref::<RawFailure>() {
            return raw.clone();
        }
        if let Some(io_err) = self.downcast_ref::<io::Error>() {
            return io_err.to_raw_failure();
        }
        RawFailure::from_error(GENERIC_ERROR_NAME, &**self)
    }
}

impl AsRawFailure for anyhow::Error {
    fn to_raw_failure(&self) -> RawFailure {
        if let Some(raw) = self.downcast_ref::<RawFailure>() {
            return raw.clone();
        }
        if let Some(io_err) = self.downcast_ref::<io::Error>() {
            return io_err.to_raw_failure();
        }
        if let Some(http_err) = self.downcast_ref::<reqwest::Error>() {
            return http_err.to_raw_failure();
        }
        RawFailure::from_error(GENERIC_ERROR_NAME, &**self)
    }
}

impl AsRawFailure for CircuitOpenError {
    fn to_raw_failure(&self) -> RawFailure {
        RawFailure::typed("CircuitOpenError", self.to_string())
    }
}

impl<E: AsRawFailure> AsRawFailure for HealingError<E> {
    fn to_raw_failure(&self) -> RawFailure {
        match self {
            HealingError::CircuitOpen(open) => open.to_raw_failure(),
            HealingError::Operation(err) => err.to_raw_failure(),
        }
    }
}

/// First `max_chars` characters of `text`, never splitting a code point
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
