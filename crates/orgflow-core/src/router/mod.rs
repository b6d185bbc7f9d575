//! Event Router
//!
//! Deterministic dispatch from subject to handler. Bindings are registered once
//! at startup; overlapping patterns are rejected when the router is built, so
//! registration order never decides which handler runs.

/// Subject pattern parsing and subject builders.
pub mod subject;

pub use subject::SubjectPattern;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::handlers::{EventHandler, HandlerOutcome};
use std::sync::Arc;
use tracing::{debug, warn};

/// A registered (pattern, handler) pair.
struct Binding {
    pattern: SubjectPattern,
    handler: Arc<dyn EventHandler>,
}

/// Result of routing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran and returned this outcome
    Handled {
        /// Name of the handler that ran
        handler: String,
        /// The handler's outcome, unchanged
        outcome: HandlerOutcome,
    },
    /// No binding matched the subject
    Unrouted,
}

/// Builder that collects bindings and checks them for overlap.
#[derive(Default)]
pub struct RouterBuilder {
    bindings: Vec<(String, Arc<dyn EventHandler>)>,
}

impl RouterBuilder {
    /// Bind a subject pattern to a handler.
    #[must_use]
    pub fn route(mut self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.bindings.push((pattern.into(), handler));
        self
    }

    /// Validate every pattern and reject overlapping pairs.
    pub fn build(self) -> Result<Router> {
        let mut bindings: Vec<Binding> = Vec::with_capacity(self.bindings.len());

        for (raw, handler) in self.bindings {
            let pattern = SubjectPattern::parse(&raw)?;

            if let Some(existing) = bindings.iter().find(|b| b.pattern.overlaps(&pattern)) {
                return Err(Error::config(
                    "router.bindings",
                    format!(
                        "pattern '{}' ({}) overlaps '{}' ({})",
                        pattern,
                        handler.name(),
                        existing.pattern,
                        existing.handler.name()
                    ),
                ));
            }

            debug!(pattern = %pattern, handler = handler.name(), "Route registered");
            bindings.push(Binding { pattern, handler });
        }

        Ok(Router { bindings })
    }
}

/// Immutable subject router.
pub struct Router {
    bindings: Vec<Binding>,
}

impl Router {
    /// Start building a router.
    #[must_use]
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Number of registered bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the router has no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Registered patterns, in registration order.
    pub fn patterns(&self) -> impl Iterator<Item = &SubjectPattern> {
        self.bindings.iter().map(|b| &b.pattern)
    }

    /// Name of the handler bound to `subject`, if any.
    #[must_use]
    pub fn resolve(&self, subject: &str) -> Option<&str> {
        self.find(subject).map(|b| b.handler.name())
    }

    fn find(&self, subject: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.pattern.matches(subject))
    }

    /// Invoke the handler bound to `subject` and hand back its outcome.
    pub async fn dispatch(&self, subject: &str, event: &Event) -> Dispatch {
        let Some(binding) = self.find(subject) else {
            warn!(subject = %subject, target = %event.target, "No handler for subject");
            return Dispatch::Unrouted;
        };

        let outcome = binding.handler.handle(event).await;
        debug!(
            subject = %subject,
            handler = binding.handler.name(),
            outcome = %outcome,
            "Event dispatched"
        );

        Dispatch::Handled {
            handler: binding.handler.name().to_string(),
            outcome,
        }
    }
}
