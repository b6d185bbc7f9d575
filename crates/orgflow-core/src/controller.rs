//! Controller
//!
//! Ties the pieces together for one organization: evaluate the bootstrap
//! stage, and while in `SteadyState` run the consumer loop with the built-in
//! handlers bound to the session the evaluation produced. Passive stages wait
//! for the recheck interval and look again.

use crate::bootstrap::{BootstrapMachine, BootstrapStage};
use crate::consumer::{ConsumerConfig, ConsumerLoop, ConsumerStats};
use crate::error::{Error, Result};
use crate::event::CHANGE_DOMAIN;
use crate::event_bus::ConnectionEvents;
use crate::handlers::{
    LoggingRegenerator, RegenerationHandler, Regenerator, TemplateChangeHandler,
    WorkflowStatusHandler, REGENERATION_REQUESTED, TEMPLATE_CHANGED, WORKFLOW_STATUS,
};
use crate::lock::{LockManager, DEFAULT_LOCK_TTL};
use crate::router::subject::validate_token;
use crate::router::Router;
use crate::session::Broker;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Organization token, or `*` for every organization on the bus
    pub organization: String,
    /// Consumer tuning; the subject filter is derived from `organization`
    pub consumer: ConsumerConfig,
    /// Lock lifetime
    pub lock_ttl: Duration,
    /// Re-evaluation interval while passive
    pub recheck_interval: Duration,
}

impl ControllerConfig {
    /// Settings for `organization` with defaults elsewhere.
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            consumer: ConsumerConfig::default(),
            lock_ttl: DEFAULT_LOCK_TTL,
            recheck_interval: Duration::from_secs(30),
        }
    }

    fn pattern(&self, event_type: &str) -> String {
        format!("{}.{}.{}", CHANGE_DOMAIN, self.organization, event_type)
    }
}

/// Runs the controller for one organization.
pub struct Controller {
    machine: Arc<BootstrapMachine>,
    events: ConnectionEvents,
    config: ControllerConfig,
    regenerator: Arc<dyn Regenerator>,
    stats: Arc<ConsumerStats>,
}

impl Controller {
    /// Create a controller. `events` must be the bus the connector reports on.
    pub fn new(
        machine: Arc<BootstrapMachine>,
        events: ConnectionEvents,
        mut config: ControllerConfig,
    ) -> Result<Self> {
        if config.organization != "*" {
            validate_token(&config.organization)
                .map_err(|e| Error::config("organization", e.to_string()))?;
        }
        config.consumer.subject_pattern = config.pattern(">");

        Ok(Self {
            machine,
            events,
            config,
            regenerator: Arc::new(LoggingRegenerator),
            stats: Arc::new(ConsumerStats::default()),
        })
    }

    /// Use a custom regenerator for `regeneration_requested` events.
    #[must_use]
    pub fn with_regenerator(mut self, regenerator: Arc<dyn Regenerator>) -> Self {
        self.regenerator = regenerator;
        self
    }

    /// Counters shared across consumer restarts.
    #[must_use]
    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// The bootstrap machine driving this controller.
    #[must_use]
    pub fn machine(&self) -> Arc<BootstrapMachine> {
        Arc::clone(&self.machine)
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Build the router with the built-in handlers bound to `session`.
    pub fn router(&self, session: Arc<dyn Broker>) -> Result<Router> {
        let locks = LockManager::with_ttl(session.clone(), self.config.lock_ttl);

        Router::builder()
            .route(
                self.config.pattern(TEMPLATE_CHANGED),
                Arc::new(TemplateChangeHandler::new(session, locks.clone())),
            )
            .route(
                self.config.pattern(WORKFLOW_STATUS),
                Arc::new(WorkflowStatusHandler::new(locks)),
            )
            .route(
                self.config.pattern(REGENERATION_REQUESTED),
                Arc::new(RegenerationHandler::new(self.regenerator.clone())),
            )
            .build()
    }

    /// Run until `token` fires. Returns early only on fatal errors.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(organization = %self.config.organization, "Controller starting");

        let result = tokio::try_join!(
            self.machine.watch_connection(&self.events, token.clone()),
            self.stage_loop(&token),
        );

        if let Some(session) = self.machine.session().await {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Closing broker session failed");
            }
        }

        result.map(|_| ())
    }

    async fn stage_loop(&self, token: &CancellationToken) -> Result<()> {
        loop {
            let evaluated = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                evaluated = self.machine.evaluate() => evaluated,
            };

            let stage = match evaluated {
                Ok(stage) => stage,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Bootstrap evaluation failed, retrying");
                    if self.pause(token).await {
                        return Ok(());
                    }
                    self.machine.invalidate().await;
                    continue;
                }
            };

            if stage.is_active_orchestrator() {
                match self.machine.session().await {
                    Some(session) => self.run_steady(session, token).await?,
                    None => self.machine.invalidate().await,
                }
                continue;
            }

            info!(
                stage = %stage,
                recheck_secs = self.config.recheck_interval.as_secs(),
                "Passive stage, deferring to external CI"
            );
            if self.pause(token).await {
                return Ok(());
            }
            self.machine.invalidate().await;
        }
    }

    /// Consume until cancelled or until the stage leaves `SteadyState`.
    async fn run_steady(&self, session: Arc<dyn Broker>, token: &CancellationToken) -> Result<()> {
        let router = Arc::new(self.router(session.clone())?);
        let consumer = ConsumerLoop::new(session, router, self.config.consumer.clone())
            .with_stats(self.stats.clone());

        let consumer_token = token.child_token();
        let mut stages = self.machine.subscribe();
        if *stages.borrow_and_update() != Some(BootstrapStage::SteadyState) {
            return Ok(());
        }

        let run = consumer.run(consumer_token.clone());
        tokio::pin!(run);

        loop {
            tokio::select! {
                result = &mut run => {
                    return match result {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_fatal() => Err(e),
                        Err(e) => {
                            warn!(error = %e, "Consumer stopped, re-probing broker");
                            self.pause(token).await;
                            self.machine.invalidate().await;
                            Ok(())
                        }
                    };
                }
                changed = stages.changed() => {
                    let steady = changed.is_ok()
                        && *stages.borrow_and_update() == Some(BootstrapStage::SteadyState);
                    if !steady {
                        info!("Left steady state, stopping consumer");
                        consumer_token.cancel();
                        return match (&mut run).await {
                            Err(e) if e.is_fatal() => Err(e),
                            _ => Ok(()),
                        };
                    }
                }
            }
        }
    }

    /// Sleep for the recheck interval. True when cancelled instead.
    async fn pause(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(self.config.recheck_interval) => false,
        }
    }
}
