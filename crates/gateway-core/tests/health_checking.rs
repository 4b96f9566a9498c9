//! Passive health checking driving pool selection end-to-end (spec.md §4.4, §8).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gateway_core::balancer::SelectContext;
use gateway_core::health::passive::{Outcome, PassiveCheckConfig, PassiveHealthChecker};
use gateway_core::models::upstream::{Algorithm, Target, Upstream};
use gateway_core::pool::UpstreamPool;

fn two_target_pool() -> Arc<UpstreamPool> {
    let pool = Arc::new(UpstreamPool::new());
    let up = Upstream {
        id: "svc".to_string(),
        algorithm: Algorithm::RoundRobin,
        targets: vec![Target::new("a", 80), Target::new("b", 80)],
        health_check: None,
        canary_fraction: None,
        canary_targets: vec![],
        metadata: Default::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let mut map = HashMap::new();
    map.insert("svc".to_string(), Arc::new(up));
    pool.install(&map);
    pool
}

#[tokio::test]
async fn target_is_isolated_after_consecutive_failure_threshold() {
    let pool = two_target_pool();
    let config = PassiveCheckConfig { consecutive_failures: 3, ..PassiveCheckConfig::default() };
    let checker = PassiveHealthChecker::new(pool.clone(), config);

    checker.report("svc", "a:80", Outcome::connection_error()).await;
    checker.report("svc", "a:80", Outcome::connection_error()).await;
    assert!(pool.targets("svc").unwrap().iter().find(|t| t.host == "a").unwrap().is_healthy(), "below threshold, still healthy");

    checker.report("svc", "a:80", Outcome::connection_error()).await;
    assert!(!pool.targets("svc").unwrap().iter().find(|t| t.host == "a").unwrap().is_healthy(), "threshold reached, isolated");

    for _ in 0..4 {
        assert_eq!(pool.select("svc", SelectContext::default()).unwrap().host, "b", "isolated target must never be selected");
    }
}

#[tokio::test]
async fn target_recovers_after_isolation_window_and_a_success() {
    let pool = two_target_pool();
    let config = PassiveCheckConfig {
        consecutive_failures: 1,
        consecutive_successes: 1,
        isolation_duration: Duration::from_millis(20),
        ..PassiveCheckConfig::default()
    };
    let checker = PassiveHealthChecker::new(pool.clone(), config);

    checker.report("svc", "a:80", Outcome::connection_error()).await;
    assert!(!pool.targets("svc").unwrap().iter().find(|t| t.host == "a").unwrap().is_healthy());

    tokio::time::sleep(Duration::from_millis(25)).await;
    checker.report("svc", "a:80", Outcome::success(200)).await;

    assert!(pool.targets("svc").unwrap().iter().find(|t| t.host == "a").unwrap().is_healthy());
}

#[tokio::test]
async fn a_timeout_counts_as_a_failure_by_default() {
    let pool = two_target_pool();
    let checker = PassiveHealthChecker::new(pool.clone(), PassiveCheckConfig { consecutive_failures: 1, ..PassiveCheckConfig::default() });

    checker.report("svc", "b:80", Outcome::timeout()).await;
    assert!(!pool.targets("svc").unwrap().iter().find(|t| t.host == "b").unwrap().is_healthy());
}
