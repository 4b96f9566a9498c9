//! The versioned, immutable configuration bundle (spec.md GLOSSARY
//! "Snapshot"; §4.1/§5 "copy-on-write").

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::plugin::Plugin;
use crate::models::route::Route;
use crate::models::upstream::Upstream;

/// Routes, upstreams and plugins as they were at the moment of install,
/// keyed by id for O(1) lookup by the components that need the raw
/// entity rather than a compiled form.
///
/// `ConfigSnapshot` itself carries no compiled state — compiling routes
/// into a [`crate::matcher::RouteMatcher`] is a separate step performed
/// by [`crate::config::store::ConfigStore`] on install, so that a
/// snapshot can be constructed, validated and round-tripped through
/// JSON without forcing regex compilation.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub routes: Vec<Route>,
    pub upstreams: HashMap<String, Arc<Upstream>>,
    pub plugins: HashMap<String, Plugin>,
}

impl ConfigSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            routes: Vec::new(),
            upstreams: HashMap::new(),
            plugins: HashMap::new(),
        }
    }

    pub fn upstream(&self, id: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.get(id)
    }

    /// Plugin ids a route opted into, via the `plugins` metadata
    /// convention (comma-separated list), filtered to enabled plugins
    /// the snapshot actually has.
    pub fn plugins_for_route<'a>(&'a self, route: &Route) -> Vec<&'a Plugin> {
        let Some(list) = route.metadata.get("plugins") else {
            return Vec::new();
        };
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|id| self.plugins.get(id))
            .filter(|p| p.is_active())
            .collect()
    }
}
