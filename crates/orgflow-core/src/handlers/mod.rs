//! Event Handlers
//!
//! A handler receives a decoded [`Event`] and classifies its own result as
//! success, retryable failure or permanent failure. The consumer loop maps
//! that outcome to ack / nak / dead-letter and never second-guesses it.

mod regeneration;
mod template;
mod workflow;

pub use regeneration::{LoggingRegenerator, RegenerationHandler, Regenerator};
pub use template::TemplateChangeHandler;
pub use workflow::WorkflowStatusHandler;

use crate::error::Error;
use crate::event::Event;
use async_trait::async_trait;
use std::fmt;

/// Event type emitted when templates change
pub const TEMPLATE_CHANGED: &str = "template_changed";
/// Event type asking for a repository regeneration
pub const REGENERATION_REQUESTED: &str = "regeneration_requested";
/// Event type reporting CI workflow progress
pub const WORKFLOW_STATUS: &str = "workflow_status";

/// How a handler invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done; acknowledge
    Success,
    /// Try again later
    Retryable(String),
    /// Will never succeed; acknowledge and record
    Permanent(String),
}

impl HandlerOutcome {
    /// Retryable failure with a reason.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    /// Permanent failure with a reason.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Classify an error by [`Error::is_retryable`].
    pub fn from_error(error: &Error) -> Self {
        if error.is_retryable() {
            Self::Retryable(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }

    /// Whether the outcome is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Retryable(reason) => write!(f, "retryable: {}", reason),
            Self::Permanent(reason) => write!(f, "permanent: {}", reason),
        }
    }
}

/// Something that can act on an event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in logs and routing diagnostics.
    fn name(&self) -> &str;

    /// Handle one event.
    async fn handle(&self, event: &Event) -> HandlerOutcome;
}
