//! Cluster (orchestrator event-stream) discovery driver (spec.md §4.5).
//!
//! The driver itself is orchestrator-agnostic: it owns the restart/backoff
//! loop and the `Registry` surface, and delegates the actual event stream
//! to a [`ClusterSource`] supplied by the embedder (a Kubernetes watch, a
//! Consul blocking query, anything that can hand back a channel of
//! [`ServiceEvent`]s). This keeps `gateway-core` free of a dependency on
//! any one orchestrator's client library.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::{mpsc, watch, RwLock};

use super::{DiscoveryError, Instance, Registry, ServiceEvent, WatchCallback};

const RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Produces a live event stream from an orchestrator. A watch that
/// terminates (channel closed) is restarted by the driver after
/// [`RESTART_BACKOFF`] (spec.md §4.5 "Failure handling").
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn watch_events(&self) -> Result<mpsc::Receiver<ServiceEvent>, DiscoveryError>;
    /// A lightweight liveness probe. Failing this only fails registry
    /// creation, never an already-running watch (spec.md §4.5 "a driver
    /// Ping failure only fails creation, never teardown").
    async fn ping(&self) -> Result<(), DiscoveryError>;
}

pub struct ClusterRegistry<S: ClusterSource> {
    source: Arc<S>,
    state: RwLock<HashMap<String, Vec<Instance>>>,
    watchers: RwLock<HashMap<String, WatchCallback>>,
}

impl<S: ClusterSource + 'static> ClusterRegistry<S> {
    pub async fn connect(source: S) -> Result<Self, DiscoveryError> {
        source.ping().await?;
        Ok(Self {
            source: Arc::new(source),
            state: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
        })
    }

    async fn apply_event(&self, event: ServiceEvent) {
        let name = event.service_name().to_string();
        {
            let mut state = self.state.write().await;
            match &event {
                ServiceEvent::Added(_, instances) | ServiceEvent::Updated(_, instances) => {
                    state.insert(name.clone(), instances.clone());
                }
                ServiceEvent::Removed(_) => {
                    state.remove(&name);
                }
            }
        }
        if let Some(cb) = self.watchers.read().await.get(&name).cloned() {
            tokio::spawn(async move { cb(event) });
        }
    }

    /// Drives the event stream, restarting it with a fixed back-off any
    /// time the orchestrator's channel closes.
    pub fn spawn_driver(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            'outer: loop {
                let mut events = match self.source.watch_events().await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!("cluster discovery watch failed to start: {e}, retrying in {RESTART_BACKOFF:?}");
                        if wait_or_shutdown(RESTART_BACKOFF, &mut shutdown).await {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                };

                loop {
                    tokio::select! {
                        event = events.recv() => {
                            match event {
                                Some(event) => self.apply_event(event).await,
                                None => {
                                    warn!("cluster discovery event stream closed, restarting in {RESTART_BACKOFF:?}");
                                    if wait_or_shutdown(RESTART_BACKOFF, &mut shutdown).await {
                                        break 'outer;
                                    }
                                    continue 'outer;
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("cluster discovery driver shutting down");
                                break 'outer;
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Sleeps for `duration` unless shutdown fires first. Returns `true` if
/// shutdown fired.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[async_trait]
impl<S: ClusterSource + 'static> Registry for ClusterRegistry<S> {
    async fn get_service(&self, name: &str) -> Result<Vec<Instance>, DiscoveryError> {
        self.state
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DiscoveryError::UnknownService { name: name.to_string() })
    }

    async fn list_services(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.state.read().await.keys().cloned().collect())
    }

    async fn watch(&self, name: &str, callback: WatchCallback) -> Result<(), DiscoveryError> {
        self.watchers.write().await.insert(name.to_string(), callback);
        Ok(())
    }

    async fn unwatch(&self, name: &str) -> Result<(), DiscoveryError> {
        self.watchers.write().await.remove(name);
        Ok(())
    }

    async fn health(&self) -> Result<(), DiscoveryError> {
        self.source.ping().await
    }

    async fn close(&self) -> Result<(), DiscoveryError> {
        self.watchers.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource {
        ping_calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterSource for FlakySource {
        async fn watch_events(&self) -> Result<mpsc::Receiver<ServiceEvent>, DiscoveryError> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(ServiceEvent::Added(
                        "orders".to_string(),
                        vec![Instance::new("10.1.0.1", 9000)],
                    ))
                    .await;
                // tx drops here, closing the stream to exercise restart.
            });
            Ok(rx)
        }

        async fn ping(&self) -> Result<(), DiscoveryError> {
            self.ping_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn connect_pings_source_once() {
        let source = FlakySource { ping_calls: AtomicUsize::new(0) };
        let registry = ClusterRegistry::connect(source).await.unwrap();
        assert_eq!(registry.source.ping_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn applied_event_is_visible_via_get_service() {
        let source = FlakySource { ping_calls: AtomicUsize::new(0) };
        let registry = ClusterRegistry::connect(source).await.unwrap();
        registry
            .apply_event(ServiceEvent::Added("orders".to_string(), vec![Instance::new("10.1.0.1", 9000)]))
            .await;
        let instances = registry.get_service("orders").await.unwrap();
        assert_eq!(instances[0].host, "10.1.0.1");

        registry.apply_event(ServiceEvent::Removed("orders".to_string())).await;
        assert!(registry.get_service("orders").await.is_err());
    }
}
