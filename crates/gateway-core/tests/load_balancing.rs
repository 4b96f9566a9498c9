//! End-to-end load-balancing scenarios against the live pool (spec.md §8).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use gateway_core::balancer::SelectContext;
use gateway_core::models::upstream::{Algorithm, Target, Upstream};
use gateway_core::pool::UpstreamPool;

fn upstream(id: &str, algorithm: Algorithm, targets: Vec<Target>) -> Upstream {
    Upstream {
        id: id.to_string(),
        algorithm,
        targets,
        health_check: None,
        canary_fraction: None,
        canary_targets: vec![],
        metadata: Default::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn install_one(pool: &UpstreamPool, up: Upstream) {
    let mut map = HashMap::new();
    let id = up.id.clone();
    map.insert(id, Arc::new(up));
    pool.install(&map);
}

#[test]
fn round_robin_cycles_through_targets_in_order() {
    let pool = UpstreamPool::new();
    install_one(&pool, upstream("svc", Algorithm::RoundRobin, vec![Target::new("a", 80), Target::new("b", 80), Target::new("c", 80)]));

    let mut seen = Vec::new();
    for _ in 0..6 {
        let t = pool.select("svc", SelectContext::default()).unwrap();
        seen.push(t.host);
    }
    assert_eq!(seen, vec!["a", "b", "c", "a", "b", "c"]);
}

#[test]
fn weighted_round_robin_honors_declared_weights() {
    let pool = UpstreamPool::new();
    let mut heavy = Target::new("heavy", 80);
    heavy.weight = 3;
    let light = Target::new("light", 80);
    install_one(&pool, upstream("svc", Algorithm::WeightedRoundRobin, vec![heavy, light]));

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..8 {
        let t = pool.select("svc", SelectContext::default()).unwrap();
        *counts.entry(t.host).or_insert(0) += 1;
    }
    assert_eq!(counts.get("heavy").copied().unwrap_or(0), 6);
    assert_eq!(counts.get("light").copied().unwrap_or(0), 2);
}

#[test]
fn ip_hash_is_stable_for_the_same_client() {
    let pool = UpstreamPool::new();
    install_one(&pool, upstream("svc", Algorithm::IpHash, vec![Target::new("a", 80), Target::new("b", 80), Target::new("c", 80)]));

    let ctx = SelectContext { client_ip: Some("203.0.113.7") };
    let first = pool.select("svc", ctx).unwrap().host;
    for _ in 0..10 {
        assert_eq!(pool.select("svc", ctx).unwrap().host, first);
    }
}

#[test]
fn ip_hash_excludes_weight_zero_targets() {
    let pool = UpstreamPool::new();
    let mut drained = Target::new("drained", 80);
    drained.weight = 0;
    install_one(&pool, upstream("svc", Algorithm::IpHash, vec![drained, Target::new("live", 80)]));

    let ctx = SelectContext { client_ip: Some("198.51.100.9") };
    for _ in 0..10 {
        assert_eq!(pool.select("svc", ctx).unwrap().host, "live");
    }
}

#[test]
fn unhealthy_targets_are_never_selected() {
    let pool = UpstreamPool::new();
    install_one(&pool, upstream("svc", Algorithm::RoundRobin, vec![Target::new("a", 80).with_healthy(false), Target::new("b", 80)]));

    for _ in 0..5 {
        assert_eq!(pool.select("svc", SelectContext::default()).unwrap().host, "b");
    }
}

#[test]
fn all_targets_unhealthy_yields_no_healthy_target_error() {
    let pool = UpstreamPool::new();
    install_one(&pool, upstream("svc", Algorithm::RoundRobin, vec![Target::new("a", 80).with_healthy(false)]));

    let err = pool.select("svc", SelectContext::default()).unwrap_err();
    assert_eq!(err, gateway_core::balancer::SelectError::NoHealthyTarget { upstream_id: "svc".into() });
}

#[test]
fn balancer_state_survives_a_hot_reinstall_of_the_same_upstream_id() {
    let pool = UpstreamPool::new();
    install_one(&pool, upstream("svc", Algorithm::RoundRobin, vec![Target::new("a", 80), Target::new("b", 80)]));
    assert_eq!(pool.select("svc", SelectContext::default()).unwrap().host, "a");

    // Reinstall with the same id and targets; round-robin position must carry over.
    install_one(&pool, upstream("svc", Algorithm::RoundRobin, vec![Target::new("a", 80), Target::new("b", 80)]));
    assert_eq!(pool.select("svc", SelectContext::default()).unwrap().host, "b");
}
