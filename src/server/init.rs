//! Controller initialization and main run loop
//!
//! Wires configuration into a connector, bootstrap machine and controller,
//! starts the health endpoint and drives everything until a shutdown signal.

use super::config::AppConfig;
use super::health::{self, HealthState};
use super::loader::load_config;
use super::validation::{validate_config, validate_production_config};
use anyhow::{anyhow, Context, Result};
use orgflow_core::{
    format_error_for_cli, wait_for_shutdown_signal, BootstrapMachine, BrokerConnector,
    ConnectionEvents, ConnectionPlan, Controller, MemoryBroker, NatsConnector, ShutdownController,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Options from the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Use the in-process broker instead of NATS
    pub memory: bool,
}

/// Turn a core error into a CLI diagnostic.
pub fn cli_error(error: orgflow_core::Error) -> anyhow::Error {
    anyhow!(format_error_for_cli(&error).trim_end().to_string())
}

/// Load and validate configuration.
pub fn load_validated_config() -> Result<AppConfig> {
    let config = load_config().context("Failed to load configuration")?;
    validate_config(&config)?;
    validate_production_config(&config)?;
    Ok(config)
}

/// Connector for the configured broker, or an in-process broker.
pub fn build_connector(
    config: &AppConfig,
    events: &ConnectionEvents,
    memory: bool,
) -> Result<Arc<dyn BrokerConnector>> {
    if memory {
        warn!("Using the in-process broker; events are not shared with other processes");
        return Ok(Arc::new(
            MemoryBroker::new()
                .with_events(events.clone())
                .with_dedup_window(config.lock.ttl())
                .with_ack_wait(Duration::from_secs(config.consumer.ack_wait_secs)),
        ));
    }

    let plan = ConnectionPlan::resolve(&config.broker).map_err(cli_error)?;
    for profile in plan.profiles() {
        info!(
            profile = %profile.name,
            deployment = %profile.deployment_type,
            endpoints = ?profile.endpoints,
            credentials = profile.credentials.kind(),
            tls = profile.tls.enabled,
            "Connection profile resolved"
        );
    }

    Ok(Arc::new(
        NatsConnector::new(plan, events.clone()).with_settings(config.jetstream_settings()),
    ))
}

/// Run the controller
pub async fn run(options: RunOptions) -> Result<()> {
    info!("Starting orgflow controller v{}", env!("CARGO_PKG_VERSION"));

    let config = load_validated_config()?;
    info!(organization = %config.organization, "Configuration loaded");

    let events = ConnectionEvents::default();
    let connector = build_connector(&config, &events, options.memory)?;
    let machine = Arc::new(BootstrapMachine::new(connector, config.state_backend()));
    let controller = Controller::new(machine.clone(), events, config.controller_config())
        .map_err(cli_error)?;

    let shutdown = ShutdownController::with_grace(config.shutdown.grace());

    // outlives the drain so the endpoint can report it
    let health_token = CancellationToken::new();
    let health_handle = if config.health.enabled {
        let bind: SocketAddr = config
            .health
            .bind
            .parse()
            .context("Invalid health bind address")?;
        let state = HealthState {
            organization: config.organization.clone(),
            machine,
            stats: controller.stats(),
            shutdown: shutdown.clone(),
        };
        let token = health_token.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = health::serve(bind, state, token).await {
                warn!("Health endpoint stopped: {:#}", e);
            }
        }))
    } else {
        None
    };

    let signal_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                warn!(error = %e, "Signal handling unavailable");
                return false;
            }
            shutdown.shutdown().await
        })
    };

    let guard = shutdown.register_task();
    let result = controller.run(shutdown.token()).await;
    drop(guard);

    let drained = if shutdown.is_shutting_down() {
        signal_handle.await.unwrap_or(false)
    } else {
        signal_handle.abort();
        shutdown.shutdown().await
    };
    if !drained {
        warn!("Shutdown grace period exceeded");
    }

    health_token.cancel();
    if let Some(handle) = health_handle {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Health endpoint shutdown timeout");
        }
    }

    result.map_err(cli_error)?;
    info!("orgflow shutdown complete");
    Ok(())
}
