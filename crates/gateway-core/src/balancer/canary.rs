//! Canary (spec.md §4.2 "Canary").
//!
//! A fraction of matched traffic is routed to a designated canary target
//! subset; the remainder uses an underlying baseline strategy. The split
//! key is resolved once per request by the caller (header, cookie or
//! client IP) and passed in as `ctx.client_ip`-style opaque key material;
//! when no key is available the split falls back to uniform random.

use rand::Rng;

use crate::balancer::{LoadBalancer, SelectContext};
use crate::models::upstream::Target;
use crate::utils::fnv::fnv1a_32;

/// Wraps a baseline strategy and applies the canary split on top of it.
#[derive(Debug)]
pub struct CanaryState<B: LoadBalancer> {
    /// Fraction (0.0..=1.0) of traffic sent to the canary subset.
    fraction: f64,
    /// `host:port` keys that make up the canary subset.
    canary_keys: Vec<String>,
    baseline: B,
}

impl<B: LoadBalancer> CanaryState<B> {
    pub fn new(fraction: f64, canary_keys: Vec<String>, baseline: B) -> Self {
        Self { fraction: fraction.clamp(0.0, 1.0), canary_keys, baseline }
    }

    fn is_canary_request(&self, split_key: Option<&str>) -> bool {
        if self.fraction <= 0.0 {
            return false;
        }
        if self.fraction >= 1.0 {
            return true;
        }
        let sample = match split_key {
            Some(key) => (fnv1a_32(key) as f64) / (u32::MAX as f64),
            None => rand::thread_rng().gen::<f64>(),
        };
        sample < self.fraction
    }
}

impl<B: LoadBalancer> LoadBalancer for CanaryState<B> {
    fn select<'t>(&self, healthy: &[&'t Target], ctx: SelectContext<'_>) -> Option<&'t Target> {
        if healthy.is_empty() {
            return None;
        }

        if self.is_canary_request(ctx.client_ip) {
            let canary: Vec<&'t Target> = healthy
                .iter()
                .filter(|t| self.canary_keys.iter().any(|k| k == t.key().as_str()))
                .copied()
                .collect();
            if !canary.is_empty() {
                return self.baseline.select(&canary, ctx);
            }
            // No healthy canary target: fall through to baseline pool,
            // same as the remainder of non-canary traffic.
        }

        let baseline_pool: Vec<&'t Target> = healthy
            .iter()
            .filter(|t| !self.canary_keys.iter().any(|k| k == t.key().as_str()))
            .copied()
            .collect();
        if baseline_pool.is_empty() {
            self.baseline.select(healthy, ctx)
        } else {
            self.baseline.select(&baseline_pool, ctx)
        }
    }
}
