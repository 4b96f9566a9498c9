//! Multiplexes named registries behind a default one (spec.md §4.5 "A
//! `Manager` multiplexes named registries behind a default one").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{DiscoveryError, Instance, Registry, WatchCallback};

pub struct Manager {
    default: Arc<dyn Registry>,
    named: RwLock<HashMap<String, Arc<dyn Registry>>>,
}

impl Manager {
    pub fn new(default: Arc<dyn Registry>) -> Self {
        Self { default, named: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, name: impl Into<String>, registry: Arc<dyn Registry>) {
        self.named.write().await.insert(name.into(), registry);
    }

    pub async fn unregister(&self, name: &str) {
        self.named.write().await.remove(name);
    }

    /// Resolves `registry_name` to a concrete registry, falling back to
    /// the default when `None` or when the name is unregistered.
    async fn resolve(&self, registry_name: Option<&str>) -> Arc<dyn Registry> {
        match registry_name {
            Some(name) => self.named.read().await.get(name).cloned().unwrap_or_else(|| self.default.clone()),
            None => self.default.clone(),
        }
    }

    pub async fn get_service(&self, registry_name: Option<&str>, service: &str) -> Result<Vec<Instance>, DiscoveryError> {
        self.resolve(registry_name).await.get_service(service).await
    }

    pub async fn list_services(&self, registry_name: Option<&str>) -> Result<Vec<String>, DiscoveryError> {
        self.resolve(registry_name).await.list_services().await
    }

    pub async fn watch(&self, registry_name: Option<&str>, service: &str, callback: WatchCallback) -> Result<(), DiscoveryError> {
        self.resolve(registry_name).await.watch(service, callback).await
    }

    pub async fn unwatch(&self, registry_name: Option<&str>, service: &str) -> Result<(), DiscoveryError> {
        self.resolve(registry_name).await.unwatch(service).await
    }

    /// Health across every registered registry plus the default; the
    /// first failure is returned.
    pub async fn health(&self) -> Result<(), DiscoveryError> {
        self.default.health().await?;
        for registry in self.named.read().await.values() {
            registry.health().await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), DiscoveryError> {
        self.default.close().await?;
        for registry in self.named.read().await.values() {
            registry.close().await?;
        }
        Ok(())
    }
}
