//! Server configuration types
//!
//! Mirrors `config/default.toml`. Every section has serde defaults so a
//! partial file (or none at all) still deserializes.

use orgflow_core::{
    BrokerSettings, ConsumerConfig, ControllerConfig, FileStateBackend, JetStreamSettings,
    NoPriorState, RetryConfig, StateBackend,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

impl AppConfig {
    /// Controller settings for the configured organization.
    pub fn controller_config(&self) -> ControllerConfig {
        let mut controller = ControllerConfig::new(self.organization.clone());
        controller.consumer = self.consumer.to_consumer_config(self.shutdown.grace());
        controller.lock_ttl = self.lock.ttl();
        controller.recheck_interval = Duration::from_secs(self.bootstrap.recheck_interval_secs);
        controller
    }

    /// Stream settings handed to the NATS connector.
    pub fn jetstream_settings(&self) -> JetStreamSettings {
        JetStreamSettings {
            lock_ttl: self.lock.ttl(),
            ack_wait: Duration::from_secs(self.consumer.ack_wait_secs),
        }
    }

    /// Prior-state backend for bootstrap evaluation.
    pub fn state_backend(&self) -> Arc<dyn StateBackend> {
        match &self.bootstrap.state_file {
            Some(path) => Arc::new(FileStateBackend::new(path.clone())),
            None => Arc::new(NoPriorState),
        }
    }
}

/// Durable consumer configuration (exposed to TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_durable_name")]
    pub durable_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fetch_wait_secs")]
    pub fetch_wait_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Deliveries before a retryable failure is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Unacked deliveries are redelivered after this long
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
    #[serde(default = "default_nak_initial_delay_ms")]
    pub nak_initial_delay_ms: u64,
    #[serde(default = "default_nak_max_delay_ms")]
    pub nak_max_delay_ms: u64,
}

impl ConsumerSettings {
    /// Core consumer tuning. The subject filter is set by the controller.
    pub fn to_consumer_config(&self, shutdown_grace: Duration) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: self.durable_name.clone(),
            batch_size: self.batch_size.max(1),
            fetch_wait: Duration::from_secs(self.fetch_wait_secs),
            max_workers: self.max_workers.max(1),
            max_deliveries: self.max_deliveries.max(1),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            // two in-progress signals per ack wait
            progress_interval: Duration::from_millis(self.ack_wait_secs.max(1) * 500),
            shutdown_grace,
            nak_backoff: RetryConfig::default()
                .with_initial_delay(Duration::from_millis(self.nak_initial_delay_ms))
                .with_max_delay(Duration::from_millis(self.nak_max_delay_ms)),
            ..ConsumerConfig::default()
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            durable_name: default_durable_name(),
            batch_size: default_batch_size(),
            fetch_wait_secs: default_fetch_wait_secs(),
            max_workers: default_max_workers(),
            max_deliveries: default_max_deliveries(),
            handler_timeout_secs: default_handler_timeout_secs(),
            ack_wait_secs: default_ack_wait_secs(),
            nak_initial_delay_ms: default_nak_initial_delay_ms(),
            nak_max_delay_ms: default_nak_max_delay_ms(),
        }
    }
}

fn default_durable_name() -> String {
    "orgflow-controller".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_fetch_wait_secs() -> u64 {
    5
}
fn default_max_workers() -> usize {
    4
}
fn default_max_deliveries() -> u32 {
    3
}
fn default_handler_timeout_secs() -> u64 {
    30
}
fn default_ack_wait_secs() -> u64 {
    30
}
fn default_nak_initial_delay_ms() -> u64 {
    1000
}
fn default_nak_max_delay_ms() -> u64 {
    60_000
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
        }
    }
}

fn default_lock_ttl_secs() -> u64 {
    120
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapSettings {
    /// Terraform state file; absent means "never provisioned"
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_recheck_interval_secs")]
    pub recheck_interval_secs: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            state_file: None,
            recheck_interval_secs: default_recheck_interval_secs(),
        }
    }
}

fn default_recheck_interval_secs() -> u64 {
    30
}

/// Health endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_bind")]
    pub bind: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_health_bind(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_bind() -> String {
    "127.0.0.1:8090".to_string()
}

/// Shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl ShutdownSettings {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

fn default_grace_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.consumer.max_deliveries, 3);
        assert_eq!(config.lock.ttl_secs, 120);
        assert_eq!(config.health.bind, "127.0.0.1:8090");
        assert!(config.bootstrap.state_file.is_none());
    }

    #[test]
    fn test_controller_config_conversion() {
        let mut config = AppConfig {
            organization: "acme".to_string(),
            ..AppConfig::default()
        };
        config.consumer.max_workers = 0;
        config.lock.ttl_secs = 300;
        config.shutdown.grace_secs = 5;

        let controller = config.controller_config();
        assert_eq!(controller.organization, "acme");
        assert_eq!(controller.lock_ttl, Duration::from_secs(300));
        assert_eq!(controller.consumer.max_workers, 1);
        assert_eq!(controller.consumer.shutdown_grace, Duration::from_secs(5));
        assert_eq!(controller.consumer.durable_name, "orgflow-controller");
        assert_eq!(controller.consumer.progress_interval, Duration::from_secs(15));

        let js = config.jetstream_settings();
        assert_eq!(js.lock_ttl, Duration::from_secs(300));
        assert_eq!(js.ack_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_state_backend_selection() {
        let mut config = AppConfig::default();
        assert_eq!(config.state_backend().describe(), "none");

        config.bootstrap.state_file = Some(PathBuf::from("terraform.tfstate"));
        assert_eq!(config.state_backend().describe(), "terraform.tfstate");
    }
}
