// src/error/mod.rs
//! Error taxonomy for the request pipeline.
//!
//! Every failure a caller can observe is one of the [`ApiError`] variants.
//! Retry and fallback decisions are made from the classification helpers
//! here, never from string matching on messages.

use std::fmt;
use thiserror::Error;

/// Connection-level failure reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The attempt exceeded its absolute timeout.
    Timeout,
    /// The connection dropped mid-flight.
    ConnectionLost,
    /// Host name could not be resolved.
    DnsFailure,
    /// TCP/TLS connection could not be established.
    CannotConnect,
    /// Anything else the HTTP stack surfaced below the HTTP layer.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timed out",
            TransportErrorKind::ConnectionLost => "connection lost",
            TransportErrorKind::DnsFailure => "DNS lookup failed",
            TransportErrorKind::CannotConnect => "cannot connect to host",
            TransportErrorKind::Other => "transport failure",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Malformed URL or request target. Never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP 401 without a readable reason; caller should re-authenticate.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    /// 5xx, plus the 4xx codes that are explicitly retried (408, 429).
    #[error("Server error ({status}){}", detail_suffix(.message))]
    ServerError {
        status: u16,
        message: Option<String>,
    },

    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Payload matched neither the envelope nor the bare shape.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// The envelope reported `success: false`; message is passed through verbatim.
    #[error("{0}")]
    Application(String),

    /// 4xx status with no readable error body.
    #[error("Unexpected HTTP status: {0}")]
    UnexpectedStatus(u16),

    /// Caller-initiated cancellation. A "do nothing" signal, not a user error.
    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

fn detail_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {}", m))
        .unwrap_or_default()
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decoding(err.to_string())
    }
}

impl ApiError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        ApiError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Failures expected to resolve on their own: timeouts, connection-level
    /// problems and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,
            ApiError::ServerError { .. } => true,
            ApiError::InvalidRequest(_)
            | ApiError::Unauthorized
            | ApiError::NotFound
            | ApiError::Decoding(_)
            | ApiError::Application(_)
            | ApiError::UnexpectedStatus(_)
            | ApiError::Cancelled
            | ApiError::Config(_) => false,
        }
    }

    /// Whether the retry engine may re-issue the request after this failure.
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }

    /// Categorizes error for metrics and monitoring
    pub fn categorize(&self) -> ErrorCategory {
        match self {
            ApiError::Transport { .. } => ErrorCategory::Network,
            ApiError::ServerError { .. } => ErrorCategory::Server,
            ApiError::Unauthorized => ErrorCategory::Authentication,
            ApiError::NotFound | ApiError::UnexpectedStatus(_) | ApiError::InvalidRequest(_) => {
                ErrorCategory::Client
            }
            ApiError::Decoding(_) => ErrorCategory::Data,
            ApiError::Application(_) => ErrorCategory::Application,
            ApiError::Cancelled => ErrorCategory::Cancellation,
            ApiError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Short human-readable message for display surfaces.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            } => "The connection timed out. Please try again.".to_string(),
            ApiError::Transport { .. } => "Check your internet connection.".to_string(),
            ApiError::ServerError { .. } => {
                "The server is having trouble right now. Please try again later.".to_string()
            }
            ApiError::Unauthorized => "Your session has expired. Please sign in again.".to_string(),
            ApiError::NotFound => "The requested item could not be found.".to_string(),
            ApiError::Application(message) => message.clone(),
            ApiError::Cancelled => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Server,
    Authentication,
    Client,
    Data,
    Application,
    Cancellation,
    Configuration,
}

pub type Result<T> = std::result::Result<T, ApiError>;
