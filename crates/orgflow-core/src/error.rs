//! Error types for orgflow-core
//!
//! This module provides the error taxonomy and user-friendly error formatting.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Broker rejected our credentials
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Broker unreachable or connection lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),

    /// Durable subscription could not be created or fetched
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// Ack or nak could not be delivered to the broker
    #[error("ack error: {0}")]
    Ack(String),

    /// Request/reply failed
    #[error("request error: {0}")]
    Request(String),

    /// Message envelope could not be decoded
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Subject or subject pattern is not well-formed
    #[error("invalid subject '{subject}': {reason}")]
    InvalidSubject {
        /// Offending subject
        subject: String,
        /// Why it was rejected
        reason: String,
    },

    /// Prior-state backend could not be read
    #[error("state backend error: {0}")]
    StateBackend(String),

    /// Operation did not finish in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Internal error (serialization, closed channels, etc.)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a configuration error on a named field
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Errors that may succeed if the same operation is tried again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Publish(_)
                | Self::Subscribe(_)
                | Self::Ack(_)
                | Self::Request(_)
                | Self::Timeout(_)
                | Self::StateBackend(_)
        )
    }

    /// Errors that must stop the process: retrying cannot help.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::Authentication(_) | Self::InvalidSubject { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {e}"))
    }
}

impl From<async_nats::ConnectError> for Error {
    fn from(e: async_nats::ConnectError) -> Self {
        use async_nats::ConnectErrorKind;
        match e.kind() {
            ConnectErrorKind::Authentication | ConnectErrorKind::AuthorizationViolation => {
                Self::Authentication(e.to_string())
            }
            ConnectErrorKind::ServerParse => Self::config("broker.urls", e.to_string()),
            _ => Self::Connection(e.to_string()),
        }
    }
}

impl From<async_nats::PublishError> for Error {
    fn from(e: async_nats::PublishError) -> Self {
        Self::Publish(e.to_string())
    }
}

impl From<async_nats::RequestError> for Error {
    fn from(e: async_nats::RequestError) -> Self {
        Self::Request(e.to_string())
    }
}

/// Trait for user-friendly error messages
///
/// Provides human-readable error messages and suggestions for fixing.
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get a suggestion for how to fix the error
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self {
            Error::InvalidConfig { field, message } => {
                format!("Configuration error in '{}': {}", field, message)
            }
            Error::Authentication(msg) => format!("Broker rejected credentials: {}", msg),
            Error::Connection(msg) => format!("Broker unreachable: {}", msg),
            Error::Publish(msg) => format!("Publish failed: {}", msg),
            Error::Subscribe(msg) => format!("Durable subscription failed: {}", msg),
            Error::Ack(msg) => format!("Acknowledgement failed: {}", msg),
            Error::Request(msg) => format!("Request failed: {}", msg),
            Error::MalformedMessage(msg) => format!("Malformed message: {}", msg),
            Error::InvalidSubject { subject, reason } => {
                format!("Invalid subject '{}': {}", subject, reason)
            }
            Error::StateBackend(msg) => format!("State backend unavailable: {}", msg),
            Error::Timeout(msg) => format!("Timed out: {}", msg),
            Error::Internal(msg) => format!("Internal error: {}", msg),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Error::InvalidConfig { field, .. } => Some(format!(
                "Check the '{}' setting in config/default.toml or the ORGFLOW_ environment.",
                field
            )),
            Error::Authentication(_) => Some(
                "Verify the credentials file or the JWT/seed pair for this deployment type."
                    .to_string(),
            ),
            Error::Connection(_) => {
                Some("Check broker.urls and that the broker is running.".to_string())
            }
            Error::InvalidSubject { .. } => Some(
                "Subject tokens must be non-empty and must not contain spaces, '.', '*' or '>'."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// Format an error for display in the CLI
pub fn format_error_for_cli(error: &Error) -> String {
    let mut output = error.user_message();

    if let Some(suggestion) = error.suggestion() {
        output.push_str("\n\n");
        output.push_str(&suggestion);
    }

    output.push('\n');
    output
}
