//! Bootstrap State Machine
//!
//! Decides whether the controller should orchestrate or stay passive:
//!
//! | broker reachable | prior state record | stage                 |
//! |------------------|--------------------|-----------------------|
//! | yes              | any                | `SteadyState`         |
//! | no               | yes                | `TerraformRecovery`   |
//! | no               | no                 | `ColdStart`           |
//!
//! In the two passive stages external CI owns provisioning and the
//! controller only re-evaluates. The evaluated stage is cached until
//! [`BootstrapMachine::invalidate`]; connection loss invalidates it.
//!
//! A session is only opened when there is none or the previous one closed
//! for good. A disconnected session is kept: the client reconnects on its
//! own and a second connection would compete with it.

use crate::error::{Error, Result};
use crate::event_bus::{ConnectionEvent, ConnectionEvents};
use crate::session::{Broker, BrokerConnector, ConnectionState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Controller role for the current environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStage {
    /// Nothing provisioned yet; CI bootstraps the broker
    ColdStart,
    /// Broker down but state exists; CI re-applies it
    TerraformRecovery,
    /// Broker up; the controller runs the consumer loop
    SteadyState,
}

impl BootstrapStage {
    /// Whether the controller should consume and act in this stage.
    #[must_use]
    pub fn is_active_orchestrator(&self) -> bool {
        matches!(self, Self::SteadyState)
    }
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColdStart => write!(f, "cold_start"),
            Self::TerraformRecovery => write!(f, "terraform_recovery"),
            Self::SteadyState => write!(f, "steady_state"),
        }
    }
}

/// Source of truth for "has this environment been provisioned before".
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Whether a prior provisioning record exists.
    async fn has_prior_state(&self) -> Result<bool>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Backend for environments that never keep provisioning state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPriorState;

#[async_trait]
impl StateBackend for NoPriorState {
    async fn has_prior_state(&self) -> Result<bool> {
        Ok(false)
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

/// Terraform state file on disk.
///
/// A record exists when the file holds a JSON object with a `serial` or a
/// non-empty `resources` array. Missing or blank files mean no record.
#[derive(Debug, Clone)]
pub struct FileStateBackend {
    path: PathBuf,
}

impl FileStateBackend {
    /// Backend reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn has_prior_state(&self) -> Result<bool> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(Error::StateBackend(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if raw.trim().is_empty() {
            return Ok(false);
        }

        let state: Value = serde_json::from_str(&raw).map_err(|e| {
            Error::StateBackend(format!("{}: not a state file: {}", self.path.display(), e))
        })?;

        let has_serial = state.get("serial").is_some_and(|s| !s.is_null());
        let has_resources = state
            .get("resources")
            .and_then(Value::as_array)
            .is_some_and(|r| !r.is_empty());
        Ok(has_serial || has_resources)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Default)]
struct Inner {
    cached: Option<BootstrapStage>,
    session: Option<Arc<dyn Broker>>,
}

/// Evaluates and caches the bootstrap stage.
pub struct BootstrapMachine {
    connector: Arc<dyn BrokerConnector>,
    state_backend: Arc<dyn StateBackend>,
    inner: Mutex<Inner>,
    stage_tx: watch::Sender<Option<BootstrapStage>>,
}

impl BootstrapMachine {
    /// Create a machine; nothing is checked until [`evaluate`](Self::evaluate).
    pub fn new(connector: Arc<dyn BrokerConnector>, state_backend: Arc<dyn StateBackend>) -> Self {
        let (stage_tx, _) = watch::channel(None);
        Self {
            connector,
            state_backend,
            inner: Mutex::new(Inner::default()),
            stage_tx,
        }
    }

    /// Current stage, probing the broker if nothing is cached.
    ///
    /// Authentication and configuration failures are returned as errors,
    /// never turned into a passive stage.
    pub async fn evaluate(&self) -> Result<BootstrapStage> {
        let mut inner = self.inner.lock().await;
        if let Some(stage) = inner.cached {
            return Ok(stage);
        }

        let existing = inner.session.as_ref().map(|s| s.connection_state());
        let stage = match existing {
            Some(ConnectionState::Connected) => BootstrapStage::SteadyState,
            Some(ConnectionState::Disconnected) => {
                debug!("Session reconnecting, staying passive");
                self.passive_stage().await?
            }
            Some(ConnectionState::Closed) | None => {
                if let Some(stale) = inner.session.take() {
                    if let Err(e) = stale.close().await {
                        warn!(error = %e, "Closing stale session failed");
                    }
                }
                match self.connector.connect().await {
                    Ok(session) => {
                        inner.session = Some(session);
                        BootstrapStage::SteadyState
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        debug!(error = %e, "Broker unreachable");
                        self.passive_stage().await?
                    }
                }
            }
        };

        inner.cached = Some(stage);
        let previous = self.stage_tx.send_replace(Some(stage));
        if previous != Some(stage) {
            info!(
                stage = %stage,
                previous = ?previous,
                state_backend = %self.state_backend.describe(),
                "Bootstrap stage evaluated"
            );
        }
        Ok(stage)
    }

    async fn passive_stage(&self) -> Result<BootstrapStage> {
        if self.state_backend.has_prior_state().await? {
            Ok(BootstrapStage::TerraformRecovery)
        } else {
            Ok(BootstrapStage::ColdStart)
        }
    }

    /// Forget the cached stage. The next [`evaluate`](Self::evaluate)
    /// checks the session again, reconnecting only if it closed.
    pub async fn invalidate(&self) {
        self.inner.lock().await.cached = None;
        debug!("Bootstrap stage invalidated");
    }

    /// Session obtained by the last successful evaluation.
    pub async fn session(&self) -> Option<Arc<dyn Broker>> {
        self.inner.lock().await.session.clone()
    }

    /// Last published stage, if any evaluation happened.
    #[must_use]
    pub fn current_stage(&self) -> Option<BootstrapStage> {
        *self.stage_tx.borrow()
    }

    /// Receive every stage change.
    pub fn subscribe(&self) -> watch::Receiver<Option<BootstrapStage>> {
        self.stage_tx.subscribe()
    }

    /// Re-evaluate on connection changes until `token` fires.
    pub async fn watch_connection(
        &self,
        events: &ConnectionEvents,
        token: CancellationToken,
    ) -> Result<()> {
        let mut rx = events.subscribe();

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = rx.recv() => event,
            };

            let reevaluate = match event {
                Ok(ConnectionEvent::Disconnected { reason }) => {
                    warn!(reason = ?reason, "Connection lost, re-evaluating bootstrap stage");
                    true
                }
                Ok(ConnectionEvent::Closed) => {
                    warn!("Connection closed, re-evaluating bootstrap stage");
                    true
                }
                Ok(ConnectionEvent::Connected { endpoint }) => {
                    let steady = self.current_stage() == Some(BootstrapStage::SteadyState);
                    if !steady {
                        info!(endpoint = %endpoint, "Broker reachable again, re-evaluating");
                    }
                    !steady
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Missed connection events, re-evaluating");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };

            if reevaluate {
                self.invalidate().await;
                if let Err(e) = self.evaluate().await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(error = %e, "Bootstrap re-evaluation failed");
                }
            }
        }
    }
}
