//! Plugin entity (spec.md §3 "Plugin").
//!
//! Plugins are declared independently of routes; a route opts into a
//! plugin by naming it in `Route.metadata` (spec.md: "Plugin binding to
//! routes is expressed via the route's metadata; an unbound plugin has no
//! effect"). The convention this gateway uses is the metadata key
//! `plugins`, a comma-separated list of plugin ids — see
//! [`crate::middleware::chain`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of cross-cutting behavior a plugin implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    Auth,
    RateLimit,
    Cors,
    TrafficMirror,
    HeaderTransform,
    MockResponse,
    CircuitBreaker,
    Wasm,
    Custom,
}

/// A configured plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub id: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

fn default_enabled() -> bool {
    true
}

impl Plugin {
    pub fn is_active(&self) -> bool {
        self.enabled
    }
}
