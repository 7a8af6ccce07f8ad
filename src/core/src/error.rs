//! Error handling for the EventConnect session core.
//!
//! This module provides:
//! - A single error type with a machine-readable code and chaining
//! - The connection/message failure taxonomy (transport, auth, send timeout, queue expiry)
//! - Retry classification used by the reconnection logic
//! - Structured logging and metrics integration
//!
//! Errors never cross into UI code from the session itself; they are logged
//! here and turned into connection state or message status by the caller.
//!
//! # Usage
//!
//! ```rust,ignore
//! use eventconnect_core::error::{ChatError, ErrorContext, Result};
//!
//! fn parse(frame: &str) -> Result<serde_json::Value> {
//!     serde_json::from_str(frame).context("Malformed frame")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::telemetry::logging::SensitiveFieldRedactor;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for session operations.
pub type Result<T> = std::result::Result<T, ChatError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Connection Errors (1000-1099)
    TransportError,
    AuthError,
    NotConnected,
    ConnectTimeout,
    InvalidStateTransition,
    SessionClosed,

    // Message Errors (1100-1199)
    SendTimeout,
    QueueExpiry,
    UnknownMessage,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Collaborator Errors (3000-3099)
    HistoryFetchFailed,
    NetworkError,
    CacheError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::TransportError => 1000,
            Self::AuthError => 1001,
            Self::NotConnected => 1002,
            Self::ConnectTimeout => 1003,
            Self::InvalidStateTransition => 1004,
            Self::SessionClosed => 1005,

            Self::SendTimeout => 1100,
            Self::QueueExpiry => 1101,
            Self::UnknownMessage => 1102,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::HistoryFetchFailed => 3000,
            Self::NetworkError => 3001,
            Self::CacheError => 3002,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Authentication failures are terminal and a timed-out send is never
    /// resent automatically, so neither is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportError
                | Self::ConnectTimeout
                | Self::NotConnected
                | Self::NetworkError
                | Self::HistoryFetchFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "connection",
            1100..=1199 => "message",
            2200..=2299 => "serialization",
            3000..=3099 => "collaborator",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected churn (stale ids, expired envelopes)
    Low,
    /// Operational issues (drops, timeouts)
    Medium,
    /// Failures that need user or operator action
    High,
    /// Bugs
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::UnknownMessage
            | ErrorCode::QueueExpiry
            | ErrorCode::NotConnected
            | ErrorCode::CacheError => Self::Low,

            ErrorCode::TransportError
            | ErrorCode::ConnectTimeout
            | ErrorCode::SendTimeout
            | ErrorCode::NetworkError
            | ErrorCode::HistoryFetchFailed
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::SessionClosed => Self::Medium,

            ErrorCode::AuthError
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InvalidStateTransition | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the session core.
#[derive(Error, Debug)]
pub struct ChatError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " ({})", internal)?;
        }
        Ok(())
    }
}

impl ChatError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a public and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Connect or network-level failure of the realtime socket.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::TransportError, "Realtime connection failed", message)
    }

    /// The server rejected the handshake credentials.
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::AuthError, "Authentication rejected", reason)
    }

    /// An emit was attempted without an open socket.
    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, "Realtime connection is not open")
    }

    /// A connection state change outside the allowed transition table.
    pub fn invalid_transition(from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid connection state transition {:?} -> {:?}", from, to),
        )
    }

    /// The socket handshake did not finish within `window`.
    pub fn connect_timeout(window: Duration) -> Self {
        Self::new(
            ErrorCode::ConnectTimeout,
            format!("Handshake did not complete within {}ms", window.as_millis()),
        )
    }

    /// No server acknowledgement arrived within the confirmation window.
    pub fn send_timeout(local_id: &str, window: Duration) -> Self {
        Self::new(
            ErrorCode::SendTimeout,
            format!(
                "Message {} was not acknowledged within {}ms",
                local_id,
                window.as_millis()
            ),
        )
    }

    /// A queued envelope aged out before the connection came back.
    pub fn queue_expiry(event_name: &str, age: Duration) -> Self {
        Self::new(
            ErrorCode::QueueExpiry,
            format!("Queued {} dropped after {}s", event_name, age.as_secs()),
        )
    }

    /// An id that the reconciliation store does not know.
    pub fn unknown_message(id: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnknownMessage, format!("Unknown message: {}", id.into()))
    }

    /// The runtime task has stopped.
    pub fn session_closed() -> Self {
        Self::new(ErrorCode::SessionClosed, "Chat session is no longer running")
    }

    /// A configuration value failed validation.
    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    ///
    /// Internal messages often carry server text, so they pass through the
    /// token redactor first.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let internal = self
            .internal_message
            .as_deref()
            .map(|m| SensitiveFieldRedactor::global().redact_value(m));

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?internal,
                    source = ?self.source,
                    "Chat session error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?internal,
                    "Chat session error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Chat session error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "chat_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ChatError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ChatError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ChatError::new(ErrorCode::UnknownMessage, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ChatError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ChatError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(error: reqwest::Error) -> Self {
        let (code, msg) = if error.is_timeout() || error.is_connect() {
            (ErrorCode::NetworkError, "Failed to reach the chat API")
        } else if let Some(status) = error.status() {
            match status.as_u16() {
                401 | 403 => (ErrorCode::AuthError, "Chat API rejected the credentials"),
                _ => (ErrorCode::HistoryFetchFailed, "Chat API returned an error"),
            }
        } else if error.is_decode() {
            (ErrorCode::DeserializationError, "Chat API returned an unreadable body")
        } else {
            (ErrorCode::NetworkError, "Network error occurred")
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let code = match &error {
            WsError::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                ErrorCode::AuthError
            }
            WsError::ConnectionClosed | WsError::AlreadyClosed => ErrorCode::NotConnected,
            _ => ErrorCode::TransportError,
        };

        Self::with_internal(code, "WebSocket error", error.to_string()).with_source(error)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ChatError {
    fn from(error: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::session_closed().with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for ChatError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::ConnectTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for ChatError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match error.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => ErrorCode::NetworkError,
            ErrorKind::TimedOut => ErrorCode::ConnectTimeout,
            _ => ErrorCode::CacheError,
        };

        Self::with_internal(code, "An I/O error occurred", error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for ChatError {
    fn from(error: config::ConfigError) -> Self {
        let (code, msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, msg, error.to_string())
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ChatError>() {
            Ok(chat_error) => chat_error,
            Err(error) => Self::internal(error.to_string()),
        }
    }
}
