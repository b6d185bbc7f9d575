//! `workflow_status`: track CI progress and release locks on completion.

use super::{EventHandler, HandlerOutcome, TEMPLATE_CHANGED, WORKFLOW_STATUS};
use crate::event::Event;
use crate::lock::LockManager;
use async_trait::async_trait;
use tracing::{info, warn};

/// Releases the lock a finished workflow was running under.
pub struct WorkflowStatusHandler {
    locks: LockManager,
}

impl WorkflowStatusHandler {
    /// Create the handler.
    pub fn new(locks: LockManager) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl EventHandler for WorkflowStatusHandler {
    fn name(&self) -> &str {
        WORKFLOW_STATUS
    }

    async fn handle(&self, event: &Event) -> HandlerOutcome {
        let (Some(workflow), Some(status)) = (event.data_str("workflow"), event.data_str("status"))
        else {
            return HandlerOutcome::permanent("data.workflow and data.status must be strings");
        };

        match status {
            "completed" | "failed" => {
                let reason = event.data_str("reason").unwrap_or(TEMPLATE_CHANGED);
                info!(
                    organization = %event.organization,
                    target = %event.target,
                    workflow = %workflow,
                    status = %status,
                    reason = %reason,
                    "Workflow finished"
                );
                self.locks.release_key(&event.organization, reason).await;
            }
            "in_progress" | "queued" => {
                info!(
                    organization = %event.organization,
                    target = %event.target,
                    workflow = %workflow,
                    status = %status,
                    "Workflow running"
                );
            }
            other => {
                warn!(
                    organization = %event.organization,
                    target = %event.target,
                    workflow = %workflow,
                    status = %other,
                    "Unknown workflow status"
                );
            }
        }

        HandlerOutcome::Success
    }
}
