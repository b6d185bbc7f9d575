//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use super::config::AppConfig;
use anyhow::{Context, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let builder = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!(
                "config/{}",
                std::env::var("ORGFLOW_ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        .add_source(File::with_name("config/local").required(false))
        // 3. Environment variables (highest priority)
        // prefix_separator("_") so ORGFLOW_BROKER__URLS works with a single _ after the prefix.
        .add_source(
            Environment::with_prefix("ORGFLOW")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("broker.urls")
                .with_list_parse_key("broker.managed_urls")
                .try_parsing(true),
        );

    deserialize(legacy_overrides(builder, |name| std::env::var(name).ok())?)
}

/// Parse `overrides` (TOML) on top of the embedded defaults, ignoring the
/// environment.
#[cfg(test)]
pub fn load_config_from_str(overrides: &str) -> Result<AppConfig> {
    deserialize(
        Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(overrides, FileFormat::Toml)),
    )
}

fn deserialize(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<AppConfig> {
    builder
        .build()
        .context("Failed to build configuration")?
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Plain variables read by existing deployments, mapped to config keys.
/// The first variable of each entry that is set and non-empty wins.
const LEGACY_STRINGS: &[(&str, &[&str])] = &[
    ("broker.creds_file", &["NATS_CREDS_FILE", "NATS_CREDS"]),
    ("broker.nkey_file", &["NATS_NKEY_FILE"]),
    ("broker.jwt", &["NATS_JWT"]),
    ("broker.nkey_seed", &["NATS_NKEY_SEED"]),
    ("broker.deployment_type", &["NATS_DEPLOYMENT_TYPE"]),
    ("broker.jetstream_domain", &["NATS_JETSTREAM_DOMAIN"]),
    ("broker.tls.cert_file", &["NATS_TLS_CERT_FILE"]),
    ("broker.tls.key_file", &["NATS_TLS_KEY_FILE"]),
    ("broker.tls.ca_file", &["NATS_TLS_CA_FILE"]),
    ("organization", &["GITHUB_ORG"]),
];

/// Variables used by existing deployments. They win over every other
/// source; empty values are ignored.
///
/// Endpoints come from `NATS_URL` or `NATS_URLS` (comma separated, the
/// former wins), TLS is switched on by `NATS_TLS_ENABLED=true`, and the
/// rest map one to one through [`LEGACY_STRINGS`].
fn legacy_overrides<F>(
    builder: ConfigBuilder<config::builder::DefaultState>,
    lookup: F,
) -> Result<ConfigBuilder<config::builder::DefaultState>>
where
    F: Fn(&str) -> Option<String>,
{
    let set = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    let urls = set("NATS_URL").or_else(|| set("NATS_URLS")).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    });
    let tls = set("NATS_TLS_ENABLED")
        .filter(|flag| flag.trim() == "true")
        .map(|_| true);

    let mut builder = builder
        .set_override_option("broker.urls", urls)
        .and_then(|b| b.set_override_option("broker.tls.enabled", tls))
        .context("Failed to apply legacy environment overrides")?;

    for (key, names) in LEGACY_STRINGS {
        let value = names.iter().find_map(|name| set(name));
        builder = builder
            .set_override_option(*key, value)
            .with_context(|| format!("Failed to apply legacy override for {key}"))?;
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgflow_core::DeploymentType;
    use std::collections::HashMap;

    #[test]
    fn test_embedded_defaults_parse() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.organization, "");
        assert_eq!(
            config.broker.deployment_type,
            DeploymentType::SelfHostedSingle
        );
        assert_eq!(config.broker.urls, vec!["nats://localhost:4222"]);
        assert_eq!(config.consumer.durable_name, "orgflow-controller");
        assert_eq!(config.consumer.max_deliveries, 3);
        assert_eq!(config.lock.ttl_secs, 120);
        assert!(config.health.enabled);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let config = load_config_from_str(
            r#"
            organization = "acme"

            [broker]
            deployment_type = "hybrid"
            creds_file = "/etc/orgflow/user.creds"

            [lock]
            ttl_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.organization, "acme");
        assert_eq!(config.broker.deployment_type, DeploymentType::Hybrid);
        assert_eq!(
            config.broker.creds_file.as_deref(),
            Some(std::path::Path::new("/etc/orgflow/user.creds"))
        );
        assert_eq!(config.lock.ttl_secs, 600);
        // untouched sections keep their defaults
        assert_eq!(config.consumer.batch_size, 10);
    }

    fn with_vars(vars: &HashMap<&str, &str>) -> AppConfig {
        let builder = Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
        let builder =
            legacy_overrides(builder, |name| vars.get(name).map(|v| v.to_string())).unwrap();
        deserialize(builder).unwrap()
    }

    #[test]
    fn test_legacy_variables_override() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("NATS_URL", "nats://a:4222, nats://b:4222"),
            ("NATS_CREDS", "/run/secrets/nats.creds"),
            ("GITHUB_ORG", "acme"),
        ]);
        let config = with_vars(&vars);

        assert_eq!(config.broker.urls, vec!["nats://a:4222", "nats://b:4222"]);
        assert_eq!(
            config.broker.creds_file.as_deref(),
            Some(std::path::Path::new("/run/secrets/nats.creds"))
        );
        assert_eq!(config.organization, "acme");
    }

    #[test]
    fn test_full_nats_variable_surface() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("NATS_URLS", "tls://a:4222,tls://b:4222"),
            ("NATS_CREDS_FILE", "/run/secrets/user.creds"),
            ("NATS_CREDS", "/ignored.creds"),
            ("NATS_NKEY_FILE", "/run/secrets/user.nk"),
            ("NATS_JWT", "eyJ0eXAi"),
            ("NATS_NKEY_SEED", "SUAEXAMPLE"),
            ("NATS_DEPLOYMENT_TYPE", "synadia_cloud"),
            ("NATS_JETSTREAM_DOMAIN", "leaf"),
            ("NATS_TLS_ENABLED", "true"),
            ("NATS_TLS_CERT_FILE", "/tls/client.pem"),
            ("NATS_TLS_KEY_FILE", "/tls/client.key"),
            ("NATS_TLS_CA_FILE", "/tls/ca.pem"),
        ]);
        let config = with_vars(&vars);
        let path = |p: &str| Some(std::path::PathBuf::from(p));

        assert_eq!(config.broker.urls, vec!["tls://a:4222", "tls://b:4222"]);
        assert_eq!(config.broker.creds_file, path("/run/secrets/user.creds"));
        assert_eq!(config.broker.nkey_file, path("/run/secrets/user.nk"));
        assert_eq!(config.broker.jwt.as_deref(), Some("eyJ0eXAi"));
        assert_eq!(config.broker.nkey_seed.as_deref(), Some("SUAEXAMPLE"));
        assert_eq!(config.broker.deployment_type, DeploymentType::ManagedCloud);
        assert_eq!(config.broker.jetstream_domain.as_deref(), Some("leaf"));
        assert!(config.broker.tls.enabled);
        assert_eq!(config.broker.tls.cert_file, path("/tls/client.pem"));
        assert_eq!(config.broker.tls.key_file, path("/tls/client.key"));
        assert_eq!(config.broker.tls.ca_file, path("/tls/ca.pem"));
    }

    #[test]
    fn test_legacy_url_wins_and_empty_values_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("NATS_URL", "nats://legacy:4222"),
            ("NATS_URLS", "nats://a:4222,nats://b:4222"),
            ("NATS_DEPLOYMENT_TYPE", "self_hosted"),
            ("NATS_JWT", ""),
            ("NATS_TLS_ENABLED", "yes"),
        ]);
        let config = with_vars(&vars);

        assert_eq!(config.broker.urls, vec!["nats://legacy:4222"]);
        assert_eq!(
            config.broker.deployment_type,
            DeploymentType::SelfHostedSingle
        );
        assert!(config.broker.jwt.is_none());
        assert!(!config.broker.tls.enabled);
    }

    #[test]
    fn test_legacy_variables_absent() {
        let builder = Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
        let config = deserialize(legacy_overrides(builder, |_| None).unwrap()).unwrap();
        assert_eq!(config.broker.urls, vec!["nats://localhost:4222"]);
        assert!(config.broker.creds_file.is_none());
    }
}
