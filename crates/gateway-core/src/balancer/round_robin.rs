//! Round-robin (spec.md §4.2 "Round-robin").

use std::sync::atomic::{AtomicU64, Ordering};

use crate::balancer::{LoadBalancer, SelectContext};
use crate::models::upstream::Target;

/// `Index = (counter++ - 1) mod |healthy|`. The counter is never reset on
/// health changes; only the effective index space contracts/expands
/// (spec.md §4.2 "Hot updates").
#[derive(Debug, Default)]
pub struct RoundRobinState {
    counter: AtomicU64,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self { counter: AtomicU64::new(0) }
    }
}

impl LoadBalancer for RoundRobinState {
    fn select<'t>(&self, healthy: &[&'t Target], _ctx: SelectContext<'_>) -> Option<&'t Target> {
        if healthy.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (n as usize) % healthy.len();
        Some(healthy[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upstream::Target;

    #[test]
    fn fairness_over_n_selections_with_k_equal_weight_targets() {
        let rr = RoundRobinState::new();
        let a = Target::new("a", 1);
        let b = Target::new("b", 1);
        let c = Target::new("c", 1);
        let targets = [&a, &b, &c];

        let mut counts = [0u32; 3];
        let n = 100;
        for _ in 0..n {
            let pick = rr.select(&targets, SelectContext::default()).unwrap();
            let idx = targets.iter().position(|t| std::ptr::eq(*t, pick)).unwrap();
            counts[idx] += 1;
        }
        let floor = n / targets.len() as u32;
        let ceil = floor + if n % targets.len() as u32 == 0 { 0 } else { 1 };
        for c in counts {
            assert!(c == floor || c == ceil, "count {c} not in [{floor}, {ceil}]");
        }
    }
}
