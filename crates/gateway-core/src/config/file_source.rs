//! YAML-file-backed [`ConfigSource`] (spec.md §6 "ConfigSource
//! (consumed)": "each delivered payload is a complete routing
//! configuration (YAML)").
//!
//! Polls a file's modification time the same way
//! [`crate::discovery::static_file::StaticFileRegistry`] polls a
//! discovery document, re-reading and re-delivering the whole file
//! whenever it changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};

use crate::config::store::{ConfigSource, StoreError};
use crate::models::plugin::Plugin;
use crate::models::route::Route;
use crate::models::snapshot::ConfigSnapshot;
use crate::models::upstream::Upstream;

/// The on-disk shape of a routing configuration document. Flat lists,
/// not the keyed maps [`ConfigSnapshot`] uses internally, so the YAML
/// stays hand-writable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub plugins: Vec<Plugin>,
}

impl ConfigDocument {
    pub fn into_snapshot(self) -> ConfigSnapshot {
        let mut snapshot = ConfigSnapshot::empty();
        snapshot.routes = self.routes;
        snapshot.upstreams = self.upstreams.into_iter().map(|u| (u.id.clone(), Arc::new(u))).collect::<HashMap<_, _>>();
        snapshot.plugins = self.plugins.into_iter().map(|p| (p.id.clone(), p)).collect::<HashMap<_, _>>();
        snapshot
    }

    pub fn parse_yaml(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_yaml::from_slice(bytes).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

/// Parses a [`ConfigDocument`] out of raw YAML bytes and installs it.
/// Exposed standalone so `gateway-server`'s startup path and
/// [`FileConfigSource`]'s poller share one parsing/validation path.
pub fn parse_snapshot(bytes: &[u8]) -> Result<ConfigSnapshot, StoreError> {
    ConfigDocument::parse_yaml(bytes).map(ConfigDocument::into_snapshot)
}

pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<Vec<u8>, StoreError> {
        tokio::fs::read(&self.path).await.map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn mtime(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path).await.ok()?.modified().ok()
    }

    /// Polls the file for changes and re-delivers its full contents on
    /// `tx` whenever the modification time advances. Exits when
    /// `shutdown` fires.
    pub fn spawn_poller(self: Arc<Self>, tx: mpsc::Sender<Vec<u8>>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_mtime = self.mtime().await;
            let mut ticker = interval(poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = self.mtime().await;
                        if current != last_mtime {
                            last_mtime = current;
                            match self.read().await {
                                Ok(bytes) => {
                                    if tx.send(bytes).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("config file source: read failed: {e}"),
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("config file source poller shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn get(&self) -> Result<Vec<u8>, StoreError> {
        self.read().await
    }

    async fn watch(&self) -> Result<mpsc::Receiver<Vec<u8>>, StoreError> {
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self { path: self.path.clone() }).spawn_poller(tx, Duration::from_secs(2), shutdown_rx);
        Ok(rx)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
routes: []
upstreams: []
plugins: []
"#;
        let snapshot = parse_snapshot(yaml.as_bytes()).unwrap();
        assert!(snapshot.routes.is_empty());
        assert!(snapshot.upstreams.is_empty());
    }

    #[test]
    fn parses_an_upstream_and_route() {
        let yaml = r#"
upstreams:
  - id: backend
    algorithm: round_robin
    targets:
      - host: 127.0.0.1
        port: 8080
    created_at: "2024-01-01T00:00:00Z"
    updated_at: "2024-01-01T00:00:00Z"
routes:
  - id: r1
    name: default
    priority: 0
    upstream_id: backend
    rule:
      paths:
        - type: prefix
          value: /
    created_at: "2024-01-01T00:00:00Z"
    updated_at: "2024-01-01T00:00:00Z"
"#;
        let snapshot = parse_snapshot(yaml.as_bytes()).unwrap();
        assert_eq!(snapshot.upstreams.len(), 1);
        assert_eq!(snapshot.routes.len(), 1);
        assert!(snapshot.upstream("backend").is_some());
    }
}
