//! Weighted smooth round-robin, the classical Nginx algorithm
//! (spec.md §4.2 "Weighted smooth round-robin").

use std::collections::HashMap;
use std::sync::Mutex;

use crate::balancer::{LoadBalancer, SelectContext};
use crate::models::upstream::Target;

/// Per-upstream smoothed-weight state. On each selection: every healthy
/// target's `currentWeight` is bumped by its static weight, the maximum
/// is picked, and the winner's `currentWeight` is reduced by the total.
/// `currentWeight` survives target churn for targets that remain
/// (keyed by `host:port`); new targets start at 0 (spec.md §4.2 "Hot
/// updates").
#[derive(Debug, Default)]
pub struct WeightedRoundRobinState {
    current_weights: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobinState {
    pub fn new() -> Self {
        Self { current_weights: Mutex::new(HashMap::new()) }
    }
}

impl LoadBalancer for WeightedRoundRobinState {
    fn select<'t>(&self, healthy: &[&'t Target], _ctx: SelectContext<'_>) -> Option<&'t Target> {
        if healthy.is_empty() {
            return None;
        }

        let mut weights = self.current_weights.lock().expect("weighted balancer mutex poisoned");

        let live_keys: std::collections::HashSet<&str> = healthy.iter().map(|t| t.key()).collect::<Vec<_>>().into_iter().collect();
        weights.retain(|k, _| live_keys.contains(k.as_str()));

        let mut total: i64 = 0;
        let mut best_idx = 0usize;
        let mut best_weight = i64::MIN;

        for (idx, target) in healthy.iter().enumerate() {
            let key = target.key();
            let static_weight = target.effective_weight() as i64;
            total += static_weight;

            let current = weights.entry(key).or_insert(0);
            *current += static_weight;

            if *current > best_weight {
                best_weight = *current;
                best_idx = idx;
            }
        }

        let winner_key = healthy[best_idx].key();
        if let Some(w) = weights.get_mut(&winner_key) {
            *w -= total;
        }

        Some(healthy[best_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upstream::Target;

    #[test]
    fn distributes_proportionally_to_weight() {
        let wrr = WeightedRoundRobinState::new();
        let a = Target::new("a", 1);
        let mut a = a;
        a.weight = 5;
        let mut b = Target::new("b", 1);
        b.weight = 1;
        let mut c = Target::new("c", 1);
        c.weight = 1;
        let targets = [&a, &b, &c];

        let mut counts = HashMap::new();
        for _ in 0..7 {
            let pick = wrr.select(&targets, SelectContext::default()).unwrap();
            *counts.entry(pick.key()).or_insert(0) += 1;
        }

        assert_eq!(counts.get("a:1").copied().unwrap_or(0), 5);
        assert_eq!(counts.get("b:1").copied().unwrap_or(0), 1);
        assert_eq!(counts.get("c:1").copied().unwrap_or(0), 1);
    }

    #[test]
    fn new_target_current_weight_starts_at_zero() {
        let wrr = WeightedRoundRobinState::new();
        let a = Target::new("a", 1);
        wrr.select(&[&a], SelectContext::default());
        assert_eq!(*wrr.current_weights.lock().unwrap().get("a:1").unwrap(), 0);
    }
}
