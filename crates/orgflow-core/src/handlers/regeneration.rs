//! `regeneration_requested`: hand off to whatever regenerates repositories.

use super::{EventHandler, HandlerOutcome, REGENERATION_REQUESTED};
use crate::error::Result;
use crate::event::Event;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Performs the actual regeneration of a target.
#[async_trait]
pub trait Regenerator: Send + Sync {
    /// Regenerate `event.target`. Errors are classified by
    /// [`crate::Error::is_retryable`].
    async fn regenerate(&self, event: &Event) -> Result<()>;
}

/// Regenerator that only records the request. Used until an external CI
/// pipeline picks the event up from the bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRegenerator;

#[async_trait]
impl Regenerator for LoggingRegenerator {
    async fn regenerate(&self, event: &Event) -> Result<()> {
        let files = event
            .data
            .get("files")
            .and_then(|f| f.as_array())
            .map_or(0, Vec::len);
        info!(
            organization = %event.organization,
            target = %event.target,
            triggered_by = event.data_str("triggered_by").unwrap_or("unknown"),
            files = files,
            "Regeneration requested"
        );
        Ok(())
    }
}

/// Routes `regeneration_requested` events to a [`Regenerator`].
pub struct RegenerationHandler {
    regenerator: Arc<dyn Regenerator>,
}

impl RegenerationHandler {
    /// Create the handler.
    pub fn new(regenerator: Arc<dyn Regenerator>) -> Self {
        Self { regenerator }
    }
}

impl Default for RegenerationHandler {
    fn default() -> Self {
        Self::new(Arc::new(LoggingRegenerator))
    }
}

#[async_trait]
impl EventHandler for RegenerationHandler {
    fn name(&self) -> &str {
        REGENERATION_REQUESTED
    }

    async fn handle(&self, event: &Event) -> HandlerOutcome {
        match self.regenerator.regenerate(event).await {
            Ok(()) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }
}
