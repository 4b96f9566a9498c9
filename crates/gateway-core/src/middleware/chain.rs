//! Compiles the plugins bound to a configuration snapshot into the
//! stateful middleware instances the request path actually calls
//! (spec.md §4.6 "The chain is composed once per configuration
//! snapshot").
//!
//! Plugins are declared data ([`crate::models::plugin::Plugin`]); this
//! module is where a `Plugin{type: rate_limit, config: {...}}` becomes a
//! live [`crate::middleware::rate_limit::RateLimiter`] with its own
//! cell table, kept alive across requests and rebuilt only when the
//! snapshot that defined it changes (spec.md §4.1 "copy-on-write":
//! the plugin chain follows the same swap discipline as the matcher).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::middleware::auth::{ApiKeyAuthenticator, AuthChain, Authenticator, BasicAuthAuthenticator, JwtAuthenticator};
use crate::middleware::metrics::{GatewayMetrics, MetricsProvider};
use crate::middleware::mirror::{MirrorDispatcher, MirrorTarget};
use crate::middleware::mock::{MockResponder, MockRule};
use crate::middleware::rate_limit::{RateLimitConfig, RateLimiter};
use crate::models::plugin::{Plugin, PluginType};
use crate::models::snapshot::ConfigSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AuthenticatorConfig {
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        #[serde(default = "default_api_key_query")]
        query: String,
        keys: HashMap<String, String>,
    },
    Jwt {
        secret: String,
        #[serde(default)]
        issuer: Option<String>,
        #[serde(default)]
        audience: Option<String>,
    },
    Basic {
        credentials: HashMap<String, String>,
    },
}

fn default_api_key_header() -> String {
    "X-Api-Key".to_string()
}
fn default_api_key_query() -> String {
    "api_key".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthPluginConfig {
    #[serde(default)]
    authenticators: Vec<AuthenticatorConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MockPluginConfig {
    #[serde(default)]
    rules: Vec<MockRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MirrorPluginConfig {
    #[serde(default)]
    targets: Vec<MirrorTarget>,
}

fn build_auth_chain(config: AuthPluginConfig) -> AuthChain {
    let authenticators: Vec<Arc<dyn Authenticator>> = config
        .authenticators
        .into_iter()
        .map(|a| -> Arc<dyn Authenticator> {
            match a {
                AuthenticatorConfig::ApiKey { header, query, keys } => Arc::new(ApiKeyAuthenticator::new(header, query, keys)),
                AuthenticatorConfig::Jwt { secret, issuer, audience } => Arc::new(JwtAuthenticator::new(&secret, issuer, audience)),
                AuthenticatorConfig::Basic { credentials } => Arc::new(BasicAuthAuthenticator::new(credentials)),
            }
        })
        .collect();
    AuthChain::new(authenticators)
}

/// The compiled, request-path-ready form of every plugin in one
/// snapshot, keyed by plugin id so a route's `plugins_for_route` lookup
/// resolves straight to live state.
pub struct CompiledChain {
    pub auth: HashMap<String, Arc<AuthChain>>,
    pub rate_limit: HashMap<String, Arc<RateLimiter>>,
    pub mock: HashMap<String, Arc<MockResponder>>,
    pub mirror: HashMap<String, Arc<MirrorDispatcher>>,
}

impl CompiledChain {
    fn compile(snapshot: &ConfigSnapshot, mirror_client: &Client, mirror_source: &str) -> Self {
        let mut auth = HashMap::new();
        let mut rate_limit = HashMap::new();
        let mut mock = HashMap::new();
        let mut mirror = HashMap::new();

        for plugin in snapshot.plugins.values() {
            if !plugin.is_active() {
                continue;
            }
            match plugin.plugin_type {
                PluginType::Auth => match serde_json::from_value::<AuthPluginConfig>(plugin.config.clone()) {
                    Ok(cfg) => {
                        auth.insert(plugin.id.clone(), Arc::new(build_auth_chain(cfg)));
                    }
                    Err(e) => warn!("plugin {}: malformed auth config: {e}", plugin.id),
                },
                PluginType::RateLimit => match serde_json::from_value::<RateLimitConfig>(plugin.config.clone()) {
                    Ok(cfg) => {
                        rate_limit.insert(plugin.id.clone(), Arc::new(RateLimiter::new(cfg)));
                    }
                    Err(e) => warn!("plugin {}: malformed rate_limit config: {e}", plugin.id),
                },
                PluginType::MockResponse => match serde_json::from_value::<MockPluginConfig>(plugin.config.clone()) {
                    Ok(cfg) => {
                        mock.insert(plugin.id.clone(), Arc::new(MockResponder::new(cfg.rules)));
                    }
                    Err(e) => warn!("plugin {}: malformed mock_response config: {e}", plugin.id),
                },
                PluginType::TrafficMirror => match serde_json::from_value::<MirrorPluginConfig>(plugin.config.clone()) {
                    Ok(cfg) => {
                        mirror.insert(plugin.id.clone(), Arc::new(MirrorDispatcher::new(mirror_client.clone(), cfg.targets, mirror_source.to_string())));
                    }
                    Err(e) => warn!("plugin {}: malformed traffic_mirror config: {e}", plugin.id),
                },
                _ => {}
            }
        }

        Self { auth, rate_limit, mock, mirror }
    }
}

/// Owns the currently-installed [`CompiledChain`], swapped atomically on
/// every configuration install the same way [`crate::matcher::RouteMatcher`]
/// is.
pub struct MiddlewareChain {
    compiled: RwLock<Arc<CompiledChain>>,
    metrics: Arc<GatewayMetrics>,
    mirror_client: Client,
    mirror_source: String,
    cleanup_handles: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MiddlewareChain {
    pub fn new(metrics_provider: &dyn MetricsProvider, mirror_client: Client, mirror_source: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            compiled: RwLock::new(Arc::new(CompiledChain {
                auth: HashMap::new(),
                rate_limit: HashMap::new(),
                mock: HashMap::new(),
                mirror: HashMap::new(),
            })),
            metrics: Arc::new(GatewayMetrics::new(metrics_provider)),
            mirror_client,
            mirror_source: mirror_source.into(),
            cleanup_handles: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Compiles and installs the plugins bound to `snapshot`. Every
    /// newly-compiled rate limiter gets its own cleanup-sweep task
    /// (spec.md §4.6.2); limiters whose plugin id disappears have their
    /// sweep aborted.
    pub fn install(&self, snapshot: &ConfigSnapshot) {
        let compiled = CompiledChain::compile(snapshot, &self.mirror_client, &self.mirror_source);

        let mut handles = self.cleanup_handles.lock().expect("cleanup handle map poisoned");
        for (id, limiter) in &compiled.rate_limit {
            if !handles.contains_key(id) {
                let handle = limiter.clone().spawn_cleanup_sweep(self.shutdown_tx.subscribe());
                handles.insert(id.clone(), handle);
            }
        }
        handles.retain(|id, handle| {
            let still_present = compiled.rate_limit.contains_key(id);
            if !still_present {
                handle.abort();
            }
            still_present
        });
        drop(handles);

        *self.compiled.write().expect("chain lock poisoned") = Arc::new(compiled);
    }

    pub fn current(&self) -> Arc<CompiledChain> {
        self.compiled.read().expect("chain lock poisoned").clone()
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::metrics::PrometheusMetricsProvider;
    use serde_json::json;

    fn plugin(id: &str, plugin_type: PluginType, config: serde_json::Value) -> Plugin {
        Plugin { id: id.to_string(), plugin_type, enabled: true, config }
    }

    #[tokio::test]
    async fn compiles_rate_limit_plugin_into_a_live_limiter() {
        let mut snapshot = ConfigSnapshot::empty();
        snapshot.plugins.insert(
            "rl1".to_string(),
            plugin("rl1", PluginType::RateLimit, json!({"key_strategy": "ip", "max_requests": 2, "window_secs": 60})),
        );

        let provider = PrometheusMetricsProvider::new();
        let chain = MiddlewareChain::new(&provider, Client::new(), "gateway");
        chain.install(&snapshot);

        let compiled = chain.current();
        let limiter = compiled.rate_limit.get("rl1").unwrap();
        assert!(limiter.check("x").allowed);
        assert!(limiter.check("x").allowed);
        assert!(!limiter.check("x").allowed);
    }

    #[tokio::test]
    async fn disabled_plugin_is_not_compiled() {
        let mut snapshot = ConfigSnapshot::empty();
        let mut p = plugin("rl1", PluginType::RateLimit, json!({"key_strategy": "ip", "max_requests": 2, "window_secs": 60}));
        p.enabled = false;
        snapshot.plugins.insert("rl1".to_string(), p);

        let provider = PrometheusMetricsProvider::new();
        let chain = MiddlewareChain::new(&provider, Client::new(), "gateway");
        chain.install(&snapshot);

        assert!(chain.current().rate_limit.is_empty());
    }
}
