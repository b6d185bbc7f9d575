//! `template_changed`: request one regeneration per organization per lock TTL.

use super::{EventHandler, HandlerOutcome, REGENERATION_REQUESTED, TEMPLATE_CHANGED};
use crate::error::Result;
use crate::event::Event;
use crate::lock::{LockManager, LockOutcome};
use crate::session::{Broker, PublishOutcome};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Turns template changes into a single `regeneration_requested` event.
///
/// The lock on `(organization, template_changed)` is left held after a
/// successful publish; the matching `workflow_status` completion releases
/// it, or the TTL does.
///
/// Redeliveries of the same event resume its hold and republish the request
/// under an idempotency key derived from the event, so an attempt cut off
/// after taking the lock still produces exactly one request.
pub struct TemplateChangeHandler {
    broker: Arc<dyn Broker>,
    locks: LockManager,
}

impl TemplateChangeHandler {
    /// Create the handler.
    pub fn new(broker: Arc<dyn Broker>, locks: LockManager) -> Self {
        Self { broker, locks }
    }

    async fn publish(&self, request: &Event, fingerprint: &str) -> Result<(String, PublishOutcome)> {
        let subject = request.subject()?;
        let key = format!("regen:{fingerprint}");
        let outcome = self
            .broker
            .publish(&subject, request.to_payload()?, Some(&key))
            .await?;
        Ok((subject, outcome))
    }
}

/// Stable identity of an event across redeliveries.
pub(crate) fn fingerprint(event: &Event) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(event.to_payload()?);
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..32].to_string())
}

#[async_trait]
impl EventHandler for TemplateChangeHandler {
    fn name(&self) -> &str {
        TEMPLATE_CHANGED
    }

    async fn handle(&self, event: &Event) -> HandlerOutcome {
        let files = match event.data.get("files") {
            Some(Value::Array(files)) => files.clone(),
            _ => return HandlerOutcome::permanent("data.files must be an array"),
        };

        let fingerprint = match fingerprint(event) {
            Ok(fingerprint) => fingerprint,
            Err(e) => return HandlerOutcome::from_error(&e),
        };

        let lock = match self
            .locks
            .try_acquire_for(&event.organization, TEMPLATE_CHANGED, &fingerprint)
            .await
        {
            Ok(LockOutcome::Acquired(lock)) => lock,
            Ok(LockOutcome::Held) => {
                info!(
                    organization = %event.organization,
                    target = %event.target,
                    "Regeneration already in progress, skipping"
                );
                return HandlerOutcome::Success;
            }
            Err(e) => return HandlerOutcome::from_error(&e),
        };

        let request = Event::new(&event.organization, &event.target, REGENERATION_REQUESTED)
            .with_data("triggered_by", "controller")
            .with_data("reason", TEMPLATE_CHANGED)
            .with_data("files", Value::Array(files));

        match self.publish(&request, &fingerprint).await {
            Ok((subject, PublishOutcome::Accepted)) => {
                info!(
                    organization = %event.organization,
                    target = %event.target,
                    subject = %subject,
                    "Regeneration requested"
                );
                HandlerOutcome::Success
            }
            Ok((subject, PublishOutcome::Duplicate)) => {
                info!(
                    organization = %event.organization,
                    target = %event.target,
                    subject = %subject,
                    "Regeneration already requested for this event"
                );
                HandlerOutcome::Success
            }
            Err(e) => {
                warn!(
                    organization = %event.organization,
                    target = %event.target,
                    error = %e,
                    "Failed to request regeneration, releasing lock"
                );
                self.locks.release(&lock).await;
                HandlerOutcome::retryable(e.to_string())
            }
        }
    }
}
