//! Upstream pool (spec.md §4.2 contract, §5 "Upstream pool: per-upstream
//! mutex guards the target list and WRR state").
//!
//! Holds, per upstream id, the current target list and the load-balancer
//! strategy bound to that upstream's configured algorithm. Strategy
//! instances are reused across configuration installs for upstream ids
//! that persist, so round-robin counters and WRR smoothed weights carry
//! over rather than resetting on every reload (spec.md §4.2 "Hot
//! updates").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::balancer::canary::CanaryState;
use crate::balancer::ip_hash::IpHashState;
use crate::balancer::round_robin::RoundRobinState;
use crate::balancer::weighted::WeightedRoundRobinState;
use crate::balancer::{LoadBalancer, SelectContext, SelectError};
use crate::discovery::ServiceEvent;
use crate::models::upstream::{Algorithm, Target, Upstream};

/// Which independent health view a checker is reporting for (spec.md
/// §4.4 "Composition rule").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthView {
    Active,
    Passive,
}

struct UpstreamEntry {
    algorithm: Algorithm,
    targets: RwLock<Vec<Target>>,
    balancer: Box<dyn LoadBalancer>,
}

fn build_balancer(upstream: &Upstream) -> Box<dyn LoadBalancer> {
    match upstream.algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobinState::new()),
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobinState::new()),
        Algorithm::IpHash => Box::new(IpHashState::new()),
        Algorithm::Canary => {
            let fraction = upstream.canary_fraction.unwrap_or(0.0);
            Box::new(CanaryState::new(fraction, upstream.canary_targets.clone(), RoundRobinState::new()))
        }
    }
}

/// Thread-safe, hot-swappable collection of per-upstream target lists
/// and balancer state.
#[derive(Default)]
pub struct UpstreamPool {
    entries: RwLock<HashMap<String, Arc<UpstreamEntry>>>,
}

impl std::fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamPool").finish_non_exhaustive()
    }
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Installs a new set of upstreams, reusing balancer state for ids
    /// that already exist. Ids no longer present are dropped.
    pub fn install(&self, upstreams: &HashMap<String, Arc<Upstream>>) {
        let mut entries = self.entries.write().expect("pool lock poisoned");
        let mut next = HashMap::with_capacity(upstreams.len());

        for (id, upstream) in upstreams {
            if let Some(existing) = entries.get(id) {
                *existing.targets.write().expect("pool lock poisoned") = upstream.targets.clone();
                next.insert(id.clone(), existing.clone());
            } else {
                next.insert(
                    id.clone(),
                    Arc::new(UpstreamEntry {
                        algorithm: upstream.algorithm,
                        targets: RwLock::new(upstream.targets.clone()),
                        balancer: build_balancer(upstream),
                    }),
                );
            }
        }

        *entries = next;
    }

    /// Selects a target for `upstream_id` (spec.md §4.2 contract).
    /// `IpHash`/`Canary` exclude weight-0 targets from the pool before
    /// the strategy sees it (spec.md §8 "weight 0 excluded from
    /// IP-hash pool").
    pub fn select(&self, upstream_id: &str, ctx: SelectContext<'_>) -> Result<Target, SelectError> {
        let entries = self.entries.read().expect("pool lock poisoned");
        let entry = entries
            .get(upstream_id)
            .ok_or_else(|| SelectError::UnknownUpstream { upstream_id: upstream_id.to_string() })?;

        let excludes_zero_weight = matches!(entry.algorithm, Algorithm::IpHash | Algorithm::Canary);
        let targets = entry.targets.read().expect("pool lock poisoned");
        let healthy: Vec<&Target> = targets
            .iter()
            .filter(|t| t.is_healthy())
            .filter(|t| !excludes_zero_weight || t.weight != 0)
            .collect();

        entry
            .balancer
            .select(&healthy, ctx)
            .cloned()
            .ok_or_else(|| SelectError::NoHealthyTarget { upstream_id: upstream_id.to_string() })
    }

    /// Flips one view of a target's health. Each of the active and
    /// passive checkers only ever writes its own view's atomic
    /// (spec.md §4.4 "Composition rule"); `Target::is_healthy` derives
    /// the externally-visible flag as the AND of both, so a checker
    /// calling this can never silently undo the other checker's
    /// isolation decision. The read lock held for the duration of the
    /// atomic store is sufficient — the store itself needs no
    /// exclusivity, and it never blocks a concurrent `select`.
    pub fn set_target_health(&self, upstream_id: &str, host: &str, port: u16, view: HealthView, healthy: bool) {
        let entries = self.entries.read().expect("pool lock poisoned");
        let Some(entry) = entries.get(upstream_id) else { return };
        let targets = entry.targets.read().expect("pool lock poisoned");
        if let Some(target) = targets.iter().find(|t| t.host == host && t.port == port) {
            match view {
                HealthView::Active => target.set_active_healthy(healthy),
                HealthView::Passive => target.set_passive_healthy(healthy),
            }
        }
    }

    /// Merges one discovery event into the live pool (spec.md §4.5
    /// "convert instance events to upstream updates"). `Added`/`Updated`
    /// replace the named upstream's whole target list — creating the
    /// upstream with a round-robin default if config never declared it —
    /// mirroring how [`Self::install`] treats a configuration snapshot as
    /// the source of truth for the target list it carries. `Removed`
    /// drops the upstream entirely. A discovery-sourced upstream's
    /// balancer state is lost if a later config install redeclares the
    /// same id with a different algorithm, same as any other hot update.
    pub fn apply_service_event(&self, event: &ServiceEvent) {
        match event {
            ServiceEvent::Added(name, instances) | ServiceEvent::Updated(name, instances) => {
                let targets: Vec<Target> = instances.iter().map(|i| i.to_target()).collect();
                let mut entries = self.entries.write().expect("pool lock poisoned");
                match entries.get(name) {
                    Some(existing) => {
                        *existing.targets.write().expect("pool lock poisoned") = targets;
                    }
                    None => {
                        entries.insert(
                            name.clone(),
                            Arc::new(UpstreamEntry {
                                algorithm: Algorithm::RoundRobin,
                                targets: RwLock::new(targets),
                                balancer: Box::new(RoundRobinState::new()),
                            }),
                        );
                    }
                }
            }
            ServiceEvent::Removed(name) => {
                self.entries.write().expect("pool lock poisoned").remove(name);
            }
        }
    }

    pub fn targets(&self, upstream_id: &str) -> Option<Vec<Target>> {
        let entries = self.entries.read().expect("pool lock poisoned");
        entries.get(upstream_id).map(|e| e.targets.read().expect("pool lock poisoned").clone())
    }

    pub fn upstream_ids(&self) -> Vec<String> {
        self.entries.read().expect("pool lock poisoned").keys().cloned().collect()
    }
}
