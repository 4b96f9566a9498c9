//! IP-hash (spec.md §4.2 "IP-hash").

use crate::balancer::{LoadBalancer, SelectContext};
use crate::models::upstream::Target;
use crate::utils::fnv::fnv1a_32;

/// Stateless: the hash is a pure function of the client IP and the
/// healthy set's size, so no per-upstream mutable state is needed beyond
/// what the caller already passes in. Weight-0 targets are excluded from
/// the pool entirely (spec.md §8 "Boundary behaviors"), so `healthy`
/// must already be filtered by the caller when that matters — the pool
/// does this (see [`crate::pool`]).
#[derive(Debug, Default)]
pub struct IpHashState;

impl IpHashState {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for IpHashState {
    fn select<'t>(&self, healthy: &[&'t Target], ctx: SelectContext<'_>) -> Option<&'t Target> {
        if healthy.is_empty() {
            return None;
        }
        let key = ctx.client_ip.unwrap_or("");
        let hash = fnv1a_32(key);
        let index = (hash as usize) % healthy.len();
        Some(healthy[index])
    }
}
