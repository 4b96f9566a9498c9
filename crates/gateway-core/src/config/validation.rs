//! Whole-snapshot configuration validation (spec.md §3 Invariant: "every
//! route's `UpstreamID` refers to an existing upstream ... if a batch
//! update would break this invariant it is rejected atomically";
//! SPEC_FULL.md §B "Config validation report").
//!
//! Generalizes the teacher's single-route `ConfigValidator` into a
//! validator over the entire proposed [`ConfigSnapshot`], so that a
//! batch of routes/upstreams/plugins is accepted or rejected as a unit
//! rather than leaving the store in a partially-applied state.

use std::collections::HashSet;

use crate::models::snapshot::ConfigSnapshot;

/// Errors and warnings produced by validating a snapshot before install.
/// `errors` reject the install outright; `warnings` are surfaced to the
/// operator but do not block it.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates a proposed snapshot structurally and referentially before
/// it is admitted. Stateless; holds no configuration of its own.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Runs every check spec.md §7(a) calls a "configuration error":
    /// malformed rule, unknown upstream reference, regex compile
    /// failure — plus upstream/target structural invariants from §3.
    pub fn validate(snapshot: &ConfigSnapshot) -> ValidationReport {
        let mut report = ValidationReport::default();

        for upstream in snapshot.upstreams.values() {
            if let Err(e) = upstream.validate() {
                report.errors.push(e.to_string());
            }
            if upstream.targets.is_empty() {
                report.warnings.push(format!(
                    "upstream {}: has no targets; selection will always return NoHealthyTarget",
                    upstream.id
                ));
            }
        }

        let mut seen_route_ids = HashSet::new();
        for route in &snapshot.routes {
            if !seen_route_ids.insert(route.id.clone()) {
                report.errors.push(format!("duplicate route id {}", route.id));
            }

            if let Err(e) = route.validate() {
                report.errors.push(e.to_string());
            }

            if !snapshot.upstreams.contains_key(&route.upstream_id) {
                report.errors.push(format!(
                    "route {}: references unknown upstream {}",
                    route.id, route.upstream_id
                ));
            }

            if route.is_unconstrained() {
                report.warnings.push(format!(
                    "route {}: rule has no constraints and matches every request",
                    route.id
                ));
            }
        }

        for plugin in snapshot.plugins.values() {
            if !plugin.enabled {
                continue;
            }
            // Plugin config bodies are free-form (spec.md §3 "Plugin"); the
            // validator only confirms the shape is an object, since every
            // middleware stage below expects to look up fields by name.
            if plugin.config.is_array() || plugin.config.is_string() || plugin.config.is_number() {
                report.warnings.push(format!(
                    "plugin {}: config is not an object; most middleware stages expect named fields",
                    plugin.id
                ));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::{Route, Rule};
    use crate::models::upstream::{Algorithm, Target, Upstream};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn route(id: &str, upstream_id: &str) -> Route {
        Route {
            id: id.to_string(),
            name: id.to_string(),
            priority: 0,
            upstream_id: upstream_id.to_string(),
            metadata: HashMap::new(),
            rule: Rule { paths: vec![], ..Default::default() },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn upstream(id: &str) -> Upstream {
        Upstream {
            id: id.to_string(),
            algorithm: Algorithm::RoundRobin,
            targets: vec![Target::new("h", 80)],
            health_check: None,
            canary_fraction: None,
            canary_targets: vec![],
            metadata: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn route_referencing_unknown_upstream_is_rejected() {
        let mut snapshot = ConfigSnapshot::empty();
        snapshot.routes.push(route("r1", "missing"));
        let report = ConfigValidator::validate(&snapshot);
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("unknown upstream")));
    }

    #[test]
    fn valid_snapshot_has_no_errors() {
        let mut snapshot = ConfigSnapshot::empty();
        snapshot.upstreams.insert("u1".to_string(), Arc::new(upstream("u1")));
        let mut r = route("r1", "u1");
        r.rule.paths = vec![crate::models::route::PathMatch {
            match_type: crate::models::route::PathMatchType::Prefix,
            value: "/api".to_string(),
        }];
        snapshot.routes.push(r);
        let report = ConfigValidator::validate(&snapshot);
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn unconstrained_route_warns_but_does_not_error() {
        let mut snapshot = ConfigSnapshot::empty();
        snapshot.upstreams.insert("u1".to_string(), Arc::new(upstream("u1")));
        snapshot.routes.push(route("r1", "u1"));
        let report = ConfigValidator::validate(&snapshot);
        assert!(report.is_valid());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn duplicate_route_ids_rejected() {
        let mut snapshot = ConfigSnapshot::empty();
        snapshot.upstreams.insert("u1".to_string(), Arc::new(upstream("u1")));
        snapshot.routes.push(route("r1", "u1"));
        snapshot.routes.push(route("r1", "u1"));
        let report = ConfigValidator::validate(&snapshot);
        assert!(!report.is_valid());
    }
}
