//! Static YAML/JSON file discovery driver (spec.md §4.5).
//!
//! Polls the document's mtime on an interval; when it changes, the whole
//! document is re-read and diffed against the previous snapshot to
//! decide which services fire `Added`/`Updated`/`Removed`. `serde_yaml`
//! parses JSON documents too, so one driver covers both formats named in
//! the spec without a second parser.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tokio::time::interval;

use super::{DiscoveryError, Instance, Registry, ServiceEvent, WatchCallback};

#[derive(Debug, Deserialize, Default)]
struct FileDocument {
    #[serde(default)]
    services: HashMap<String, Vec<FileInstance>>,
}

#[derive(Debug, Deserialize)]
struct FileInstance {
    host: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: u32,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

impl From<FileInstance> for Instance {
    fn from(f: FileInstance) -> Self {
        Instance {
            host: f.host,
            port: f.port,
            weight: f.weight,
            healthy: f.healthy,
            zone: f.zone,
            region: f.region,
            tags: f.tags,
            metadata: f.metadata,
        }
    }
}

pub struct StaticFileRegistry {
    path: PathBuf,
    state: RwLock<HashMap<String, Vec<Instance>>>,
    watchers: RwLock<HashMap<String, WatchCallback>>,
    last_mtime: StdRwLock<Option<SystemTime>>,
}

impl StaticFileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            last_mtime: StdRwLock::new(None),
        }
    }

    fn mtime(&self) -> Result<SystemTime, DiscoveryError> {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| DiscoveryError::Io { path: self.path.display().to_string(), reason: e.to_string() })
    }

    fn read_document(&self) -> Result<FileDocument, DiscoveryError> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| DiscoveryError::Io { path: self.path.display().to_string(), reason: e.to_string() })?;
        serde_yaml::from_str(&content).map_err(|e| DiscoveryError::Malformed { reason: e.to_string() })
    }

    /// Re-reads the file unconditionally and fires events for every
    /// service whose instance list changed.
    pub async fn reload(&self) -> Result<(), DiscoveryError> {
        let document = self.read_document()?;
        let mut next: HashMap<String, Vec<Instance>> = HashMap::with_capacity(document.services.len());
        for (name, instances) in document.services {
            next.insert(name, instances.into_iter().map(Instance::from).collect());
        }

        let mut state = self.state.write().await;
        let watchers = self.watchers.read().await;

        for (name, instances) in &next {
            let event = match state.get(name) {
                Some(previous) if previous == instances => continue,
                Some(_) => ServiceEvent::Updated(name.clone(), instances.clone()),
                None => ServiceEvent::Added(name.clone(), instances.clone()),
            };
            if let Some(cb) = watchers.get(name) {
                let cb = cb.clone();
                tokio::spawn(async move { cb(event) });
            }
        }
        for name in state.keys() {
            if !next.contains_key(name) {
                if let Some(cb) = watchers.get(name) {
                    let cb = cb.clone();
                    let event = ServiceEvent::Removed(name.clone());
                    tokio::spawn(async move { cb(event) });
                }
            }
        }

        *state = next;
        Ok(())
    }

    /// Polls the file's mtime on `poll_interval` and reloads only when it
    /// changes (spec.md §4.5 "polls for mtime changes").
    pub fn spawn_poller(self: std::sync::Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.mtime() {
                            Ok(mtime) => {
                                let changed = {
                                    let mut last = self.last_mtime.write().expect("lock poisoned");
                                    let changed = *last != Some(mtime);
                                    *last = Some(mtime);
                                    changed
                                };
                                if changed {
                                    if let Err(e) = self.reload().await {
                                        warn!("static discovery file reload failed: {e}");
                                    } else {
                                        debug!("static discovery file reloaded");
                                    }
                                }
                            }
                            Err(e) => warn!("static discovery file stat failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Registry for StaticFileRegistry {
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
        self.mtime().map(|_| ())
    }

    async fn close(&self) -> Result<(), DiscoveryError> {
        self.watchers.write().await.clear();
        Ok(())
    }
}
