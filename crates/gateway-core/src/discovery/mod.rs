//! Service-discovery bridge (spec.md §4.5).
//!
//! A [`Registry`] is a pluggable source of service instances; two drivers
//! ship by design ([`static_file`] and [`cluster`]) and a [`Manager`]
//! multiplexes named registries behind a default one. Every driver
//! ultimately reports [`Instance`]s, which the bridge converts into a
//! wholesale replacement of the target list for the upstream sharing the
//! service name (spec.md §4.5 "Event model").

pub mod cluster;
pub mod manager;
pub mod static_file;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::upstream::Target;

pub use manager::Manager;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("unknown service {name}")]
    UnknownService { name: String },
    #[error("registry {name} ping failed: {reason}")]
    Ping { name: String, reason: String },
    #[error("io error reading {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("malformed service document: {reason}")]
    Malformed { reason: String },
}

/// One discovered network endpoint (spec.md §4.5 "Instance mapping").
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    /// `Ready` for endpoint-slice-style sources; always `true` for the
    /// static file driver unless the document says otherwise.
    pub healthy: bool,
    pub zone: Option<String>,
    pub region: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Instance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
            healthy: true,
            zone: None,
            region: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn to_target(&self) -> Target {
        Target::new(self.host.clone(), self.port).with_healthy(self.healthy)
    }
}

/// `Added | Removed | Updated` per service (spec.md §4.5 "Event model").
/// Every variant carries the full, current instance list for the named
/// service; the bridge never emits incremental deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Added(String, Vec<Instance>),
    Updated(String, Vec<Instance>),
    Removed(String),
}

impl ServiceEvent {
    pub fn service_name(&self) -> &str {
        match self {
            ServiceEvent::Added(name, _) | ServiceEvent::Updated(name, _) => name,
            ServiceEvent::Removed(name) => name,
        }
    }
}

/// Invoked on an independent task per event so a slow callback never
/// blocks the registry's own delivery loop (spec.md §4.5 "the bridge
/// never blocks the registry's delivery").
pub type WatchCallback = Arc<dyn Fn(ServiceEvent) + Send + Sync>;

/// A source of service instances (spec.md §4.5 "Contract").
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_service(&self, name: &str) -> Result<Vec<Instance>, DiscoveryError>;
    async fn list_services(&self) -> Result<Vec<String>, DiscoveryError>;
    async fn watch(&self, name: &str, callback: WatchCallback) -> Result<(), DiscoveryError>;
    async fn unwatch(&self, name: &str) -> Result<(), DiscoveryError>;
    async fn health(&self) -> Result<(), DiscoveryError>;
    async fn close(&self) -> Result<(), DiscoveryError>;
}
