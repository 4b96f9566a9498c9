//! Typed errors shared across the data model and the collaborators that
//! mutate it (the store, the config source, the admin layer).

use thiserror::Error;

/// Errors raised while validating or installing a route, upstream or
/// plugin entity before it is admitted into a snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("route {id}: references unknown upstream {upstream_id}")]
    UnknownUpstream { id: String, upstream_id: String },

    #[error("route {id}: rule has no hosts, paths, methods, headers or query constraints and no other facet narrows it")]
    EmptyRule { id: String },

    #[error("route {id}: invalid path pattern {pattern:?}: {reason}")]
    InvalidPathPattern {
        id: String,
        pattern: String,
        reason: String,
    },

    #[error("route {id}: invalid header/query regex {pattern:?}: {reason}")]
    InvalidRegex {
        id: String,
        pattern: String,
        reason: String,
    },

    #[error("upstream {id}: duplicate target {host}:{port}")]
    DuplicateTarget { id: String, host: String, port: u16 },

    #[error("upstream {id}: target port {port} out of range (1..65535)")]
    InvalidPort { id: String, port: u32 },

    #[error("upstream {id}: health check interval/timeout/thresholds must be >= 1")]
    InvalidHealthCheck { id: String },

    #[error("plugin {id}: unknown plugin type {plugin_type:?}")]
    UnknownPluginType { id: String, plugin_type: String },
}
