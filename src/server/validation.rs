//! Configuration validation
//!
//! Hard checks that stop startup, plus security warnings for production.

use super::config::AppConfig;
use anyhow::{bail, Result};
use orgflow_core::DeploymentType;
use std::net::SocketAddr;
use tracing::warn;

/// Reject configurations the controller cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.organization.trim().is_empty() {
        bail!("Configuration error in 'organization': not set (use GITHUB_ORG or ORGFLOW_ORGANIZATION)");
    }
    if config.lock.ttl_secs == 0 {
        bail!("Configuration error in 'lock.ttl_secs': must be greater than zero");
    }
    if config.health.enabled && config.health.bind.parse::<SocketAddr>().is_err() {
        bail!(
            "Configuration error in 'health.bind': '{}' is not a socket address",
            config.health.bind
        );
    }
    Ok(())
}

/// Validate configuration for production security
pub fn validate_production_config(config: &AppConfig) -> Result<()> {
    let is_production = std::env::var("ORGFLOW_ENV")
        .map(|v| v.to_lowercase() == "production")
        .unwrap_or(false);

    if !is_production {
        return Ok(());
    }

    for warning in production_warnings(config) {
        warn!("SECURITY WARNING: {}", warning);
    }
    Ok(())
}

fn production_warnings(config: &AppConfig) -> Vec<String> {
    let broker = &config.broker;
    let mut warnings = Vec::new();

    if broker.dev_mode {
        warnings.push(
            "broker.dev_mode is enabled; unauthenticated connections are allowed.".to_string(),
        );
    }

    let self_hosted = broker.deployment_type != DeploymentType::ManagedCloud;
    if self_hosted && !broker.tls.enabled {
        warnings.push(
            "TLS is disabled for the self-hosted broker. Set [broker.tls] enabled = true."
                .to_string(),
        );
    }

    let authenticated = broker.creds_file.is_some()
        || broker.nkey_file.is_some()
        || (broker.jwt.is_some() && broker.nkey_seed.is_some());
    if !authenticated {
        warnings.push("No broker credentials are configured.".to_string());
    }

    if broker.nkey_seed.is_some() {
        warnings.push(
            "An NKey seed is set inline; prefer broker.creds_file mounted from a secret store."
                .to_string(),
        );
    }

    if config.health.enabled && config.health.bind.starts_with("0.0.0.0") {
        warnings.push(
            "Health endpoint binds to all interfaces; it exposes consumer statistics.".to_string(),
        );
    }

    warnings
}
