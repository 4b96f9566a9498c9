//! End-to-end request handling through a fully wired [`Gateway`]
//! (spec.md §4.6 "the six middleware stages in declared order").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::test::TestRequest;
use chrono::Utc;
use gateway_core::middleware::metrics::PrometheusMetricsProvider;
use gateway_core::models::plugin::{Plugin, PluginType};
use gateway_core::models::route::{PathMatch, PathMatchType, Route, Rule};
use gateway_core::models::snapshot::ConfigSnapshot;
use gateway_core::models::upstream::{Algorithm, Target, Upstream};
use gateway_core::Gateway;
use serde_json::json;

fn route_with_plugins(id: &str, path_prefix: &str, upstream_id: &str, plugins: &str) -> Route {
    let mut metadata = HashMap::new();
    if !plugins.is_empty() {
        metadata.insert("plugins".to_string(), plugins.to_string());
    }
    Route {
        id: id.to_string(),
        name: id.to_string(),
        priority: 0,
        upstream_id: upstream_id.to_string(),
        metadata,
        rule: Rule { paths: vec![PathMatch { match_type: PathMatchType::Prefix, value: path_prefix.to_string() }], ..Default::default() },
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn upstream(id: &str, targets: Vec<Target>) -> Upstream {
    Upstream {
        id: id.to_string(),
        algorithm: Algorithm::RoundRobin,
        targets,
        health_check: None,
        canary_fraction: None,
        canary_targets: vec![],
        metadata: Default::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

async fn new_gateway() -> Arc<Gateway> {
    let client = reqwest::Client::new();
    let metrics = Arc::new(PrometheusMetricsProvider::new());
    Gateway::new(client, metrics, Duration::from_secs(5))
}

#[actix_web::test]
async fn unmatched_request_returns_404() {
    let gateway = new_gateway().await;
    let req = TestRequest::get().uri("/nowhere").to_http_request();
    let resp = gateway.handle_request(req, actix_web::web::Bytes::new()).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn mock_plugin_short_circuits_before_reaching_the_proxy() {
    let gateway = new_gateway().await;

    let mock_plugin = Plugin {
        id: "mock1".to_string(),
        plugin_type: PluginType::MockResponse,
        enabled: true,
        config: json!({
            "rules": [{
                "id": "r1",
                "priority": 0,
                "condition": {"path": ["exact", "/health"]},
                "response": {"status": 200, "headers": [], "body": "ok", "delay_ms": 0}
            }]
        }),
    };

    let mut snapshot = ConfigSnapshot::empty();
    snapshot.version = 1;
    snapshot.upstreams.insert("unused-upstream".to_string(), Arc::new(upstream("unused-upstream", vec![])));
    snapshot.routes.push(route_with_plugins("health", "/health", "unused-upstream", "mock1"));
    snapshot.plugins.insert("mock1".to_string(), mock_plugin);

    gateway.install(snapshot).expect("install must succeed");

    let req = TestRequest::get().uri("/health").to_http_request();
    let resp = gateway.handle_request(req, actix_web::web::Bytes::new()).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::OK);
}

#[actix_web::test]
async fn missing_api_key_is_rejected_by_the_auth_stage() {
    let gateway = new_gateway().await;

    let mut keys = HashMap::new();
    keys.insert("secret-key".to_string(), "caller-a".to_string());

    let auth_plugin = Plugin {
        id: "auth1".to_string(),
        plugin_type: PluginType::Auth,
        enabled: true,
        config: json!({
            "authenticators": [{"kind": "api_key", "header": "X-Api-Key", "query": "api_key", "keys": keys}]
        }),
    };

    let mut snapshot = ConfigSnapshot::empty();
    snapshot.version = 1;
    snapshot.upstreams.insert("upstream-a".to_string(), Arc::new(upstream("upstream-a", vec![Target::new("127.0.0.1", 65535)])));
    snapshot.routes.push(route_with_plugins("protected", "/protected", "upstream-a", "auth1"));
    snapshot.plugins.insert("auth1".to_string(), auth_plugin);

    gateway.install(snapshot).expect("install must succeed");

    let req = TestRequest::get().uri("/protected").to_http_request();
    let resp = gateway.handle_request(req, actix_web::web::Bytes::new()).await;
    assert_eq!(resp.status(), actix_web::http::StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn rate_limit_plugin_returns_429_once_budget_is_exhausted() {
    let gateway = new_gateway().await;

    let rl_plugin = Plugin {
        id: "rl1".to_string(),
        plugin_type: PluginType::RateLimit,
        enabled: true,
        config: json!({"key_strategy": "ip", "max_requests": 1, "window_secs": 60}),
    };

    let mut snapshot = ConfigSnapshot::empty();
    snapshot.version = 1;
    snapshot.upstreams.insert("upstream-a".to_string(), Arc::new(upstream("upstream-a", vec![Target::new("127.0.0.1", 65535)])));
    snapshot.routes.push(route_with_plugins("limited", "/limited", "upstream-a", "rl1"));
    snapshot.plugins.insert("rl1".to_string(), rl_plugin);

    gateway.install(snapshot).expect("install must succeed");

    let first = TestRequest::get().uri("/limited").peer_addr("10.0.0.1:1234".parse().unwrap()).to_http_request();
    let first_resp = gateway.handle_request(first, actix_web::web::Bytes::new()).await;
    assert_ne!(first_resp.status(), actix_web::http::StatusCode::TOO_MANY_REQUESTS);

    let second = TestRequest::get().uri("/limited").peer_addr("10.0.0.1:1234".parse().unwrap()).to_http_request();
    let second_resp = gateway.handle_request(second, actix_web::web::Bytes::new()).await;
    assert_eq!(second_resp.status(), actix_web::http::StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn health_reports_the_installed_snapshot_version() {
    let gateway = new_gateway().await;
    let mut snapshot = ConfigSnapshot::empty();
    snapshot.routes.push(route_with_plugins("r1", "/", "upstream-a", ""));
    snapshot.upstreams.insert("upstream-a".to_string(), Arc::new(upstream("upstream-a", vec![Target::new("127.0.0.1", 65535)])));
    gateway.install(snapshot).unwrap();

    let health = gateway.health();
    assert_eq!(health.route_count, 1);
    assert_eq!(health.upstream_count, 1);
    assert_eq!(health.config_version, 1);
}
