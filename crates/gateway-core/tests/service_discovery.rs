//! Discovery-watcher-to-upstream-pool wiring (spec.md module 5 "discovery
//! watcher -> upstream update").

use std::sync::Arc;
use std::time::Duration;

use gateway_core::discovery::manager::Manager;
use gateway_core::discovery::static_file::StaticFileRegistry;
use gateway_core::middleware::metrics::PrometheusMetricsProvider;
use gateway_core::Gateway;

async fn new_gateway() -> Arc<Gateway> {
    let client = reqwest::Client::new();
    let metrics = Arc::new(PrometheusMetricsProvider::new());
    Gateway::new(client, metrics, Duration::from_secs(5))
}

fn write_doc(path: &std::path::Path, yaml: &str) {
    std::fs::write(path, yaml).unwrap();
}

#[tokio::test]
async fn a_registry_watch_callback_populates_the_live_pool() {
    let gateway = new_gateway().await;
    assert!(gateway.pool().targets("payments").is_none());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.yaml");
    write_doc(&path, "services:\n  payments:\n    - host: 10.0.0.1\n      port: 8080\n");

    let registry = Arc::new(StaticFileRegistry::new(&path));
    let manager = Manager::new(registry.clone());

    gateway.watch_discovery(&manager, None, "payments").await.unwrap();
    registry.reload().await.unwrap();

    // The registry's callback runs on a detached task; give it a beat.
    for _ in 0..50 {
        if gateway.pool().targets("payments").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let targets = gateway.pool().targets("payments").expect("discovery event must populate the pool");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].host, "10.0.0.1");
}

#[tokio::test]
async fn a_removed_service_drops_the_upstream_from_the_pool() {
    let gateway = new_gateway().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.yaml");
    write_doc(&path, "services:\n  payments:\n    - host: 10.0.0.1\n      port: 8080\n");

    let registry = Arc::new(StaticFileRegistry::new(&path));
    let manager = Manager::new(registry.clone());
    gateway.watch_discovery(&manager, None, "payments").await.unwrap();
    registry.reload().await.unwrap();

    for _ in 0..50 {
        if gateway.pool().targets("payments").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gateway.pool().targets("payments").is_some());

    write_doc(&path, "services: {}\n");
    registry.reload().await.unwrap();

    for _ in 0..50 {
        if gateway.pool().targets("payments").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gateway.pool().targets("payments").is_none());
}
