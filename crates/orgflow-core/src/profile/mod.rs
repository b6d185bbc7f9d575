//! Connection Profile Resolver
//!
//! Turns raw broker settings into a validated [`ConnectionPlan`]: one profile
//! per broker the controller may talk to, each with endpoints, credentials,
//! TLS policy and reconnect policy. Resolution happens once at startup and the
//! plan is immutable afterwards; reconnects reuse it.

/// Secret wrapper for credential material.
pub mod secret;

pub use secret::SecureString;

use crate::error::{Error, Result};
use crate::utils::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default endpoint for the managed cloud service
pub const MANAGED_CLOUD_ENDPOINT: &str = "connect.ngs.global";

/// Where the broker runs and how we authenticate against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    /// Hosted service; credentials are mandatory
    #[serde(alias = "synadia_cloud")]
    ManagedCloud,
    /// One self-hosted server
    #[default]
    #[serde(alias = "self_hosted")]
    SelfHostedSingle,
    /// Self-hosted cluster
    SelfHostedCluster,
    /// Managed cloud first, self-hosted as fallback
    Hybrid,
}

impl DeploymentType {
    /// Endpoints used when none are configured.
    #[must_use]
    pub fn default_endpoints(&self) -> Vec<String> {
        match self {
            Self::ManagedCloud => vec![MANAGED_CLOUD_ENDPOINT.to_string()],
            Self::SelfHostedSingle => vec!["nats://localhost:4222".to_string()],
            Self::SelfHostedCluster => vec![
                "nats://localhost:4222".to_string(),
                "nats://localhost:4223".to_string(),
                "nats://localhost:4224".to_string(),
            ],
            Self::Hybrid => vec![
                MANAGED_CLOUD_ENDPOINT.to_string(),
                "nats://localhost:4222".to_string(),
            ],
        }
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManagedCloud => write!(f, "managed_cloud"),
            Self::SelfHostedSingle => write!(f, "self_hosted_single"),
            Self::SelfHostedCluster => write!(f, "self_hosted_cluster"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// TLS settings as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Require TLS
    #[serde(default)]
    pub enabled: bool,
    /// Client certificate (PEM)
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Client key (PEM)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Extra root CA (PEM)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// Reconnect settings as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Reconnect attempts before giving up; absent means unbounded
    #[serde(default)]
    pub max_attempts: Option<usize>,
    /// First reconnect delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Timeout for a single connect attempt in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Raw broker settings, straight from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Deployment type
    #[serde(default)]
    pub deployment_type: DeploymentType,
    /// Endpoints; for hybrid deployments these are the self-hosted ones
    #[serde(default)]
    pub urls: Vec<String>,
    /// Managed cloud endpoints for hybrid deployments
    #[serde(default)]
    pub managed_urls: Vec<String>,
    /// Credentials bundle (`.creds`)
    #[serde(default)]
    pub creds_file: Option<PathBuf>,
    /// File holding an NKey seed (self-hosted only)
    #[serde(default)]
    pub nkey_file: Option<PathBuf>,
    /// User JWT, paired with `nkey_seed`
    #[serde(default)]
    pub jwt: Option<String>,
    /// User NKey seed, paired with `jwt`
    #[serde(default)]
    pub nkey_seed: Option<String>,
    /// Allow unauthenticated self-hosted connections
    #[serde(default)]
    pub dev_mode: bool,
    /// TLS
    #[serde(default)]
    pub tls: TlsSettings,
    /// JetStream domain for leafnode setups
    #[serde(default)]
    pub jetstream_domain: Option<String>,
    /// Client connection name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Reconnect limits
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Resolved credential material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Unauthenticated (development only)
    None,
    /// Credentials bundle file
    File(PathBuf),
    /// File containing an NKey seed
    NkeyFile(PathBuf),
    /// Inline JWT and seed
    JwtSeed {
        /// User JWT
        jwt: String,
        /// User seed
        seed: SecureString,
    },
}

impl Credentials {
    /// Short label for logs; never includes secret material.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::File(_) => "creds_file",
            Self::NkeyFile(_) => "nkey_file",
            Self::JwtSeed { .. } => "jwt_seed",
        }
    }

    /// Render a JWT/seed pair in the `.creds` bundle format.
    #[must_use]
    pub fn creds_bundle(jwt: &str, seed: &SecureString) -> SecureString {
        SecureString::new(format!(
            "-----BEGIN NATS USER JWT-----\n{}\n------END NATS USER JWT------\n\n\
             -----BEGIN USER NKEY SEED-----\n{}\n------END USER NKEY SEED------\n",
            jwt.trim(),
            seed.expose().trim()
        ))
    }
}

/// Validated TLS policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Require TLS
    pub enabled: bool,
    /// Client certificate and key
    pub client_cert: Option<(PathBuf, PathBuf)>,
    /// Extra root CA
    pub ca_file: Option<PathBuf>,
}

impl TlsPolicy {
    /// Validate TLS settings. Disabled TLS ignores any configured paths.
    pub fn resolve(settings: &TlsSettings) -> Result<Self> {
        if !settings.enabled {
            return Ok(Self::default());
        }

        let client_cert = match (&settings.cert_file, &settings.key_file) {
            (Some(cert), Some(key)) => {
                require_file("broker.tls.cert_file", cert)?;
                require_file("broker.tls.key_file", key)?;
                Some((cert.clone(), key.clone()))
            }
            (Some(_), None) => {
                return Err(Error::config(
                    "broker.tls.key_file",
                    "cert_file is set but key_file is missing",
                ))
            }
            (None, Some(_)) => {
                return Err(Error::config(
                    "broker.tls.cert_file",
                    "key_file is set but cert_file is missing",
                ))
            }
            (None, None) => None,
        };

        if let Some(ca) = &settings.ca_file {
            require_file("broker.tls.ca_file", ca)?;
        }

        Ok(Self {
            enabled: true,
            client_cert,
            ca_file: settings.ca_file.clone(),
        })
    }
}

/// Reconnect policy derived from settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// None means retry forever
    pub max_attempts: Option<usize>,
    /// Backoff curve between attempts
    pub backoff: RetryConfig,
    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff: RetryConfig::default()
                .with_initial_delay(Duration::from_millis(settings.initial_delay_ms))
                .with_max_delay(Duration::from_millis(settings.max_delay_ms)),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
        }
    }
}

/// Everything needed to connect to one broker.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    /// Profile name: `managed_cloud` or `self_hosted`
    pub name: String,
    /// Deployment type this profile was resolved for
    pub deployment_type: DeploymentType,
    /// Server endpoints
    pub endpoints: Vec<String>,
    /// Credentials
    pub credentials: Credentials,
    /// TLS policy
    pub tls: TlsPolicy,
    /// JetStream domain
    pub jetstream_domain: Option<String>,
    /// Reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Client connection name
    pub client_name: String,
}

/// One or more profiles in fallback order.
#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    profiles: Vec<ConnectionProfile>,
}

impl ConnectionPlan {
    /// Resolve settings into a plan, failing with the offending field name.
    pub fn resolve(settings: &BrokerSettings) -> Result<Self> {
        let tls = TlsPolicy::resolve(&settings.tls)?;
        let reconnect = ReconnectPolicy::from(&settings.reconnect);

        if let Some(domain) = settings.jetstream_domain.as_deref() {
            if domain.trim().is_empty() || domain.contains(char::is_whitespace) {
                return Err(Error::config(
                    "broker.jetstream_domain",
                    "must be a single non-empty token",
                ));
            }
        }

        let base = ProfileBase {
            settings,
            tls,
            reconnect,
        };

        let profiles = match settings.deployment_type {
            DeploymentType::ManagedCloud => {
                vec![base.managed(endpoints_or_default(
                    &settings.urls,
                    DeploymentType::ManagedCloud,
                )?)?]
            }
            kind @ (DeploymentType::SelfHostedSingle | DeploymentType::SelfHostedCluster) => {
                vec![base.self_hosted(kind, endpoints_or_default(&settings.urls, kind)?)?]
            }
            DeploymentType::Hybrid => {
                let managed = base.managed(endpoints_or_default(
                    &settings.managed_urls,
                    DeploymentType::ManagedCloud,
                )?)?;
                let self_endpoints =
                    endpoints_or_default(&settings.urls, DeploymentType::SelfHostedSingle)?;
                let kind = if self_endpoints.len() > 1 {
                    DeploymentType::SelfHostedCluster
                } else {
                    DeploymentType::SelfHostedSingle
                };
                vec![managed, base.self_hosted(kind, self_endpoints)?]
            }
        };

        Ok(Self { profiles })
    }

    /// Build a plan from already-validated profiles.
    pub fn from_profiles(profiles: Vec<ConnectionProfile>) -> Result<Self> {
        if profiles.is_empty() {
            return Err(Error::config("broker", "no connection profiles"));
        }
        Ok(Self { profiles })
    }

    /// The first profile to try.
    #[must_use]
    pub fn primary(&self) -> &ConnectionProfile {
        &self.profiles[0]
    }

    /// All profiles in fallback order.
    #[must_use]
    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    /// Look up a profile by name.
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

struct ProfileBase<'a> {
    settings: &'a BrokerSettings,
    tls: TlsPolicy,
    reconnect: ReconnectPolicy,
}

impl ProfileBase<'_> {
    fn build(
        &self,
        name: &str,
        deployment_type: DeploymentType,
        endpoints: Vec<String>,
        credentials: Credentials,
    ) -> ConnectionProfile {
        ConnectionProfile {
            name: name.to_string(),
            deployment_type,
            endpoints,
            credentials,
            tls: self.tls.clone(),
            jetstream_domain: self.settings.jetstream_domain.clone(),
            reconnect: self.reconnect.clone(),
            client_name: self
                .settings
                .client_name
                .clone()
                .unwrap_or_else(|| "orgflow-controller".to_string()),
        }
    }

    fn managed(&self, endpoints: Vec<String>) -> Result<ConnectionProfile> {
        let credentials = match (&self.settings.creds_file, jwt_seed(self.settings)?) {
            (Some(path), _) => {
                require_file("broker.creds_file", path)?;
                Credentials::File(path.clone())
            }
            (None, Some(pair)) => pair,
            (None, None) => {
                return Err(Error::config(
                    "broker.creds_file",
                    "managed_cloud requires a credentials file or a jwt/nkey_seed pair",
                ))
            }
        };
        Ok(self.build(
            "managed_cloud",
            DeploymentType::ManagedCloud,
            endpoints,
            credentials,
        ))
    }

    fn self_hosted(
        &self,
        kind: DeploymentType,
        endpoints: Vec<String>,
    ) -> Result<ConnectionProfile> {
        let settings = self.settings;
        let credentials = if let Some(path) = &settings.creds_file {
            require_file("broker.creds_file", path)?;
            Credentials::File(path.clone())
        } else if let Some(path) = &settings.nkey_file {
            require_file("broker.nkey_file", path)?;
            Credentials::NkeyFile(path.clone())
        } else if let Some(pair) = jwt_seed(settings)? {
            pair
        } else if settings.dev_mode {
            warn!(
                deployment = %kind,
                "No broker credentials configured, connecting unauthenticated (dev_mode)"
            );
            Credentials::None
        } else {
            return Err(Error::config(
                "broker.creds_file",
                "self-hosted brokers need credentials unless broker.dev_mode is enabled",
            ));
        };
        Ok(self.build("self_hosted", kind, endpoints, credentials))
    }
}

fn jwt_seed(settings: &BrokerSettings) -> Result<Option<Credentials>> {
    let jwt = settings.jwt.as_deref().filter(|s| !s.trim().is_empty());
    let seed = settings.nkey_seed.as_deref().filter(|s| !s.trim().is_empty());
    match (jwt, seed) {
        (Some(jwt), Some(seed)) => Ok(Some(Credentials::JwtSeed {
            jwt: jwt.to_string(),
            seed: SecureString::new(seed),
        })),
        (Some(_), None) => Err(Error::config(
            "broker.nkey_seed",
            "jwt is set but nkey_seed is missing",
        )),
        (None, Some(_)) => Err(Error::config(
            "broker.jwt",
            "nkey_seed is set but jwt is missing",
        )),
        (None, None) => Ok(None),
    }
}

fn endpoints_or_default(urls: &[String], kind: DeploymentType) -> Result<Vec<String>> {
    let endpoints: Vec<String> = urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect();

    if endpoints.is_empty() {
        return Ok(kind.default_endpoints());
    }
    if let Some(bad) = endpoints.iter().find(|u| u.contains(char::is_whitespace)) {
        return Err(Error::config(
            "broker.urls",
            format!("endpoint '{}' contains whitespace", bad),
        ));
    }
    Ok(endpoints)
}

fn require_file(field: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::config(
            field,
            format!("file '{}' does not exist", path.display()),
        ))
    }
}
