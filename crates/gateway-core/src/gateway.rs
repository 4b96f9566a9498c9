//! The gateway instance (spec.md §2 "System overview", §9 "Global
//! state: None, by design. The gateway instance owns the matcher
//! snapshot, pool, checkers, and middleware chain; all are reachable
//! only through its scope").
//!
//! [`Gateway`] is the single object `gateway-server` constructs at
//! startup and calls into per request. It owns every piece of mutable
//! state in the data plane and wires the six middleware stages together
//! in the declared order (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, warn};
use serde_json::json;
use tokio::sync::watch;

use crate::balancer::{SelectContext, SelectError};
use crate::config::store::ConfigStore;
use crate::discovery::{DiscoveryError, Manager, WatchCallback};
use crate::health::active::ActiveHealthChecker;
use crate::health::passive::{PassiveCheckConfig, PassiveHealthChecker};
use crate::matcher::{MatchRequest, Matched};
use crate::middleware::chain::MiddlewareChain;
use crate::middleware::metrics::PrometheusMetricsProvider;
use crate::models::snapshot::ConfigSnapshot;
use crate::pool::UpstreamPool;
use crate::proxy::ReverseProxy;
use crate::utils::ip::extract_client_ip;

/// A read-only view into the gateway's liveness, for the server's own
/// `/healthz` endpoint (SPEC_FULL.md §B "Health/readiness endpoints").
#[derive(Debug, Clone, serde::Serialize)]
pub struct GatewayHealth {
    pub config_version: u64,
    pub route_count: usize,
    pub upstream_count: usize,
}

/// Owns the configuration store, upstream pool, health checkers,
/// middleware chain and outbound client. Background tasks (active
/// health checker drivers, the passive recovery sweep, the rate-limit
/// cleanup sweep) are spawned from [`Gateway::new`] and tied to the
/// `shutdown` channel passed in, per spec.md §5 "Cancelling the
/// top-level server context cancels all periodic drivers ... and
/// in-flight outbound calls".
pub struct Gateway {
    store: Arc<ConfigStore>,
    pool: Arc<UpstreamPool>,
    chain: Arc<MiddlewareChain>,
    proxy: ReverseProxy,
    passive_checker: Arc<PassiveHealthChecker>,
    active_checker: Arc<ActiveHealthChecker>,
    active_drivers: std::sync::Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    metrics_provider: Arc<PrometheusMetricsProvider>,
}

impl Gateway {
    pub fn new(http_client: reqwest::Client, metrics_provider: Arc<PrometheusMetricsProvider>, request_timeout: Duration) -> Arc<Self> {
        let pool = Arc::new(UpstreamPool::new());
        let store = ConfigStore::new(pool.clone());
        let chain = Arc::new(MiddlewareChain::new(metrics_provider.as_ref(), http_client.clone(), "gateway"));

        let passive_checker = Arc::new(PassiveHealthChecker::new(pool.clone(), PassiveCheckConfig::default()));
        let active_checker = Arc::new(ActiveHealthChecker::new(pool.clone(), http_client.clone()));
        let proxy = ReverseProxy::new(http_client, passive_checker.clone(), request_timeout);

        let (shutdown_tx, _) = watch::channel(false);

        let gateway = Arc::new(Self {
            store,
            pool,
            chain,
            proxy,
            passive_checker,
            active_checker,
            active_drivers: std::sync::Mutex::new(HashMap::new()),
            shutdown_tx,
            metrics_provider,
        });

        gateway.passive_checker.clone().spawn_recovery_sweep(gateway.shutdown_tx.subscribe());
        gateway
    }

    /// Validates, compiles and installs a new snapshot — rebuilding the
    /// route matcher, the upstream pool's target lists, the compiled
    /// middleware chain, and the set of active-health-check drivers
    /// (one per upstream that declares a `health_check`).
    pub fn install(&self, snapshot: ConfigSnapshot) -> Result<(), crate::config::store::InstallError> {
        self.chain.install(&snapshot);
        self.reconcile_active_checkers(&snapshot);
        self.store.install(snapshot)
    }

    fn reconcile_active_checkers(&self, snapshot: &ConfigSnapshot) {
        let mut drivers = self.active_drivers.lock().expect("active driver map poisoned");

        for upstream in snapshot.upstreams.values() {
            if drivers.contains_key(&upstream.id) {
                continue;
            }
            if let Some(check) = upstream.health_check.clone() {
                let handle = self.active_checker.clone().spawn_driver(upstream.id.clone(), check, self.shutdown_tx.subscribe());
                drivers.insert(upstream.id.clone(), handle);
            }
        }

        drivers.retain(|id, handle| {
            let still_present = snapshot.upstreams.get(id).is_some_and(|u| u.health_check.is_some());
            if !still_present {
                handle.abort();
            }
            still_present
        });
    }

    /// Subscribes the live upstream pool to a discovery registry's
    /// instance-change events for `service_name` (spec.md module 5
    /// "discovery watcher -> upstream update"). Each `Added`/`Updated`/
    /// `Removed` event the registry fires is applied to
    /// [`UpstreamPool::apply_service_event`] directly — discovery is a
    /// second, independent writer to the pool alongside `ConfigStore`,
    /// not something `ConfigStore` mediates.
    pub async fn watch_discovery(&self, manager: &Manager, registry_name: Option<&str>, service_name: &str) -> Result<(), DiscoveryError> {
        let pool = self.pool.clone();
        let service = service_name.to_string();
        let callback: WatchCallback = Arc::new(move |event| {
            debug!("discovery event for {service}, updating upstream pool");
            pool.apply_service_event(&event);
        });
        manager.watch(registry_name, service_name, callback).await
    }

    pub fn health(&self) -> GatewayHealth {
        let snapshot = self.store.current_snapshot();
        GatewayHealth {
            config_version: self.store.version(),
            route_count: snapshot.routes.len(),
            upstream_count: snapshot.upstreams.len(),
        }
    }

    pub fn metrics_text(&self) -> Result<String, prometheus::Error> {
        self.metrics_provider.gather_text()
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Signals every background task spawned by this gateway to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.chain.shutdown();
    }

    /// The full request path: match, authenticate, rate-limit, mock,
    /// mirror, record metrics, proxy (spec.md §4.6).
    pub async fn handle_request(&self, req: HttpRequest, body: web::Bytes) -> HttpResponse {
        let started_at = Instant::now();
        let method = req.method().as_str().to_string();
        let path = req.path().to_string();
        let query_string = req.query_string().to_string();
        let host = req.connection_info().host().to_string();
        let request_bytes = body.len() as u64;

        let header_pairs: Vec<(String, String)> = req
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();
        let header_refs: Vec<(&str, &str)> = header_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let query_pairs = parse_query_string(&query_string);
        let query_refs: Vec<(&str, &str)> = query_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let peer_addr = req.peer_addr().map(|a| a.to_string());
        let client_ip = extract_client_ip(&header_refs, peer_addr.as_deref());

        let matcher = self.store.current_matcher();
        let match_request = MatchRequest { host: &host, path: &path, method: &method, headers: header_refs.clone(), query: query_refs.clone() };

        let Some(matched) = matcher.find_match(&match_request) else {
            let response = not_found_response(&path);
            return self.finish(&method, &path, started_at, request_bytes, response, 0);
        };

        let snapshot = self.store.current_snapshot();
        let plugins = snapshot.plugins_for_route(&matched.route);
        let compiled = self.chain.current();

        let mut response_headers: Vec<(String, String)> = Vec::new();

        // 1. Authentication.
        let auth_plugin = plugins.iter().find(|p| matches!(p.plugin_type, crate::models::plugin::PluginType::Auth));
        if let Some(plugin) = auth_plugin {
            if let Some(auth_chain) = compiled.auth.get(&plugin.id) {
                if !auth_chain.is_empty() {
                    match auth_chain.authenticate(&header_refs, &query_refs) {
                        Ok(principal) => response_headers.extend(principal.propagation_headers()),
                        Err(_) => {
                            let response = unauthorized_response(&auth_chain.challenge());
                            return self.finish(&method, &path, started_at, request_bytes, response, 0);
                        }
                    }
                }
            }
        }

        // 2. Rate limiting.
        let rate_limit_plugin = plugins.iter().find(|p| matches!(p.plugin_type, crate::models::plugin::PluginType::RateLimit));
        if let Some(plugin) = rate_limit_plugin {
            if let Some(limiter) = compiled.rate_limit.get(&plugin.id) {
                let user = response_headers.iter().find(|(n, _)| n == "X-User-Id").map(|(_, v)| v.as_str());
                let api_key = header_refs.iter().find(|(n, _)| n.eq_ignore_ascii_case("x-api-key")).map(|(_, v)| *v);
                let key = limiter.derive_key(client_ip.as_deref(), user, api_key);
                let decision = limiter.check(&key);

                response_headers.push(("X-RateLimit-Limit".to_string(), decision.limit.to_string()));
                response_headers.push(("X-RateLimit-Remaining".to_string(), decision.remaining.to_string()));
                response_headers.push(("X-RateLimit-Reset".to_string(), decision.reset_at.to_string()));

                if !decision.allowed {
                    let response = rate_limited_response(&response_headers);
                    return self.finish(&method, &path, started_at, request_bytes, response, 0);
                }
            }
        }

        // 3. Mock responder.
        let mock_plugin = plugins.iter().find(|p| matches!(p.plugin_type, crate::models::plugin::PluginType::MockResponse));
        let mock_response = mock_plugin.and_then(|plugin| compiled.mock.get(&plugin.id)).and_then(|responder| {
            let mock_req = crate::middleware::mock::MockRequest {
                method: &method,
                path: &path,
                host: &host,
                query: query_refs.clone(),
                headers: header_refs.clone(),
                body: body.as_ref(),
            };
            responder.respond(&mock_req)
        });

        let (response, response_bytes) = if let Some(mock) = mock_response {
            if mock.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(mock.delay_ms)).await;
            }
            let response_bytes = mock.body.len() as u64;
            let mut builder = HttpResponse::build(StatusCode::from_u16(mock.status).unwrap_or(StatusCode::OK));
            for (name, value) in &mock.headers {
                builder.insert_header((name.as_str(), value.as_str()));
            }
            for (name, value) in &response_headers {
                builder.insert_header((name.as_str(), value.as_str()));
            }
            (builder.body(mock.body), response_bytes)
        } else {
            self.proxy_and_build_response(&matched, &snapshot, &method, &path, &query_string, &host, header_pairs.clone(), body.to_vec(), client_ip.as_deref(), response_headers).await
        };

        // 4. Traffic mirror (runs regardless of whether the mock stage
        // answered — spec.md §4.6 "After the main request completes").
        let mirror_plugin = plugins.iter().find(|p| matches!(p.plugin_type, crate::models::plugin::PluginType::TrafficMirror));
        if let Some(plugin) = mirror_plugin {
            if let Some(dispatcher) = compiled.mirror.get(&plugin.id) {
                if !dispatcher.is_empty() {
                    dispatcher.mirror(&method, &path, header_pairs, body.clone());
                }
            }
        }

        self.finish(&method, &path, started_at, request_bytes, response, response_bytes)
    }

    #[allow(clippy::too_many_arguments)]
    async fn proxy_and_build_response(
        &self,
        matched: &Matched,
        snapshot: &ConfigSnapshot,
        method: &str,
        path: &str,
        query: &str,
        host: &str,
        mut headers: Vec<(String, String)>,
        body: Vec<u8>,
        client_ip: Option<&str>,
        mut extra_response_headers: Vec<(String, String)>,
    ) -> (HttpResponse, u64) {
        if snapshot.upstream(&matched.route.upstream_id).is_none() {
            return (bad_gateway_response(), 0);
        }

        let target = match self.pool.select(&matched.route.upstream_id, SelectContext { client_ip }) {
            Ok(target) => target,
            Err(SelectError::NoHealthyTarget { .. }) => return (service_unavailable_response(), 0),
            Err(SelectError::UnknownUpstream { .. }) => return (bad_gateway_response(), 0),
        };

        if let Some(user_id) = extra_response_headers.iter().find(|(n, _)| n == "X-User-Id").map(|(_, v)| v.clone()) {
            headers.push(("X-User-Id".to_string(), user_id));
        }

        match self
            .proxy
            .forward(&matched.route.upstream_id, &target, "http", method, path, query, headers, body, client_ip, "http", host)
            .await
        {
            Ok(proxied) => {
                let response_bytes = proxied.body.len() as u64;
                let mut builder = HttpResponse::build(StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY));
                for (name, value) in &proxied.headers {
                    builder.insert_header((name.as_str(), value.as_str()));
                }
                for (name, value) in extra_response_headers.drain(..) {
                    builder.insert_header((name.as_str(), value.as_str()));
                }
                (builder.body(proxied.body), response_bytes)
            }
            Err(e) => {
                warn!("proxy error for upstream {}: {e}", matched.route.upstream_id);
                (bad_gateway_response(), 0)
            }
        }
    }

    fn finish(&self, method: &str, path: &str, started_at: Instant, request_bytes: u64, response: HttpResponse, response_bytes: u64) -> HttpResponse {
        self.chain.metrics().record(method, path, response.status().as_u16(), started_at, request_bytes, response_bytes);
        response
    }
}

/// Minimal `application/x-www-form-urlencoded` query-string parser.
/// Percent-decoding is intentionally not performed: matcher rules and
/// mock conditions compare raw query values, the same way header values
/// are compared raw.
fn parse_query_string(query: &str) -> Vec<(String, String)> {
    if query.is_empty() {
        return Vec::new();
    }
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn not_found_response(path: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({"error": "Not Found", "message": "No matching route found", "path": path}))
}

fn unauthorized_response(challenge: &str) -> HttpResponse {
    HttpResponse::Unauthorized()
        .insert_header(("WWW-Authenticate", challenge.to_string()))
        .json(json!({"error": "Unauthorized", "message": "authentication failed"}))
}

fn rate_limited_response(headers: &[(String, String)]) -> HttpResponse {
    let mut builder = HttpResponse::TooManyRequests();
    for (name, value) in headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.json(json!({"error": "Too Many Requests", "message": "rate limit exceeded"}))
}

fn bad_gateway_response() -> HttpResponse {
    HttpResponse::BadGateway().json(json!({"error": "Bad Gateway", "message": "upstream is unknown"}))
}

fn service_unavailable_response() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(json!({"error": "Service Unavailable", "message": "no healthy target"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_query_string() {
        let parsed = parse_query_string("a=1&b=2");
        assert_eq!(parsed, vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn parses_flag_without_value() {
        let parsed = parse_query_string("debug");
        assert_eq!(parsed, vec![("debug".to_string(), String::new())]);
    }

    #[test]
    fn empty_query_string_yields_no_pairs() {
        assert!(parse_query_string("").is_empty());
    }
}
