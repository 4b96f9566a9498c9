//! Gateway process configuration (ambient stack — see `SPEC_FULL.md` §A).
//!
//! Distinct from the routing domain ([`crate::models::route`],
//! [`crate::models::upstream`], [`crate::models::plugin`]), which is
//! owned by the [`crate::config::store::ConfigStore`] and reloaded live.
//! `GatewaySettings` is the process-level configuration read once at
//! startup: where to listen, how long to wait on an outbound call, and
//! how to reach the `ConfigSource`/discovery collaborators.

use serde::{Deserialize, Serialize};

/// Listener configuration (spec.md §6 "Listener").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

/// Outbound connection-pool defaults (spec.md §6 "Outbound": "a bounded
/// idle pool (100 idle, 10 per host, 90s idle timeout as defaults)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamPoolSettings {
    #[serde(default = "default_max_idle")]
    pub max_idle_connections: usize,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamPoolSettings {
    fn default() -> Self {
        Self {
            max_idle_connections: default_max_idle(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_idle() -> usize {
    100
}
fn default_max_idle_per_host() -> usize {
    10
}
fn default_idle_timeout_secs() -> u64 {
    90
}
fn default_request_timeout_secs() -> u64 {
    30
}

/// Bearer JWT verification configuration for the authentication stage
/// (spec.md §4.6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    /// HMAC secret, or the static verification key when no JWKS endpoint
    /// is configured.
    pub secret: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    /// When set, the authenticator refreshes verification keys from this
    /// JWKS endpoint instead of using `secret` directly (spec.md §4.6.1
    /// "Bearer JWT with optional JWKS refresh").
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default = "default_jwks_refresh_secs")]
    pub jwks_refresh_secs: u64,
}

fn default_jwks_refresh_secs() -> u64 {
    300
}

/// Top-level process configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default)]
    pub upstream_pool: UpstreamPoolSettings,
    #[serde(default)]
    pub jwt: Option<JwtSettings>,
    /// Path to the routing configuration document consumed by the
    /// `ConfigSource` (spec.md §6 "ConfigSource").
    #[serde(default = "default_config_path")]
    pub config_path: String,
    /// Path to the static-file discovery document, if that driver is in
    /// use (spec.md §4.5).
    #[serde(default)]
    pub discovery_file_path: Option<String>,
}

fn default_config_path() -> String {
    "gateway.yaml".to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listener: ListenerSettings::default(),
            upstream_pool: UpstreamPoolSettings::default(),
            jwt: None,
            config_path: default_config_path(),
            discovery_file_path: None,
        }
    }
}

impl GatewaySettings {
    /// Loads settings from `GATEWAY_*` environment variables if set,
    /// falling back to defaults otherwise. Process-level settings
    /// are intentionally simple; the routing domain's own validation
    /// lives in [`crate::config::validation`].
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(host) = std::env::var("GATEWAY_HOST") {
            settings.listener.host = host;
        }
        if let Ok(port) = std::env::var("GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                settings.listener.port = port;
            }
        }
        if let Ok(path) = std::env::var("GATEWAY_CONFIG_PATH") {
            settings.config_path = path;
        }
        if let Ok(path) = std::env::var("GATEWAY_DISCOVERY_FILE_PATH") {
            settings.discovery_file_path = Some(path);
        }
        settings
    }
}
