//! The configuration store and its external collaborators (spec.md §2
//! "Configuration store", §6 "Store (consumed)", "ConfigSource
//! (consumed)").
//!
//! `gateway-core` does not implement a persistent KV backend or a YAML
//! file watcher itself — those are the admin API's and the config-file
//! loader's jobs respectively (spec.md §1 "Out of scope"). What lives
//! here is the installation path both collaborators feed into: take a
//! proposed [`ConfigSnapshot`], validate it as a whole, compile a new
//! [`crate::matcher::RouteMatcher`], and atomically swap it in — or
//! reject the whole batch, leaving the previous snapshot serving
//! traffic untouched (spec.md §3 "Invariant").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::validation::ConfigValidator;
use crate::matcher::{RouteMatchError, RouteMatcher};
use crate::models::snapshot::ConfigSnapshot;
use crate::pool::UpstreamPool;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("malformed entity: {0}")]
    Malformed(String),
}

/// The minimal key/value contract the admin API persists routes,
/// upstreams and plugins through (spec.md §6 "Store (consumed)"). Keys
/// are laid out as `routes/<id>`, `upstreams/<id>`, `plugins/<id>`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    async fn watch(&self, key: &str, callback: ChangeCallback) -> Result<(), StoreError>;
    async fn unwatch(&self, key: &str) -> Result<(), StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
}

pub type ChangeCallback = Arc<dyn Fn(&str, Option<&[u8]>) + Send + Sync>;

/// A complete routing configuration document, as delivered by the
/// config-file loader (spec.md §6 "ConfigSource (consumed)": "each
/// delivered payload is a complete routing configuration (YAML)").
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self) -> Result<Vec<u8>, StoreError>;
    /// Yields every subsequent delivered payload; closes when the
    /// source is exhausted or `close()` is called.
    async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<Vec<u8>>, StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
}

/// Raised when an install attempt is rejected (spec.md §4.1
/// "Compilation failure for any rule causes the whole install to fail
/// without disturbing the previous snapshot").
#[derive(Error, Debug, Clone)]
pub enum InstallError {
    #[error("snapshot rejected: {0:?}")]
    Invalid(Vec<String>),
    #[error("route compilation failed: {0}")]
    Compile(#[from] RouteMatchError),
}

/// Owns the currently-installed [`RouteMatcher`] snapshot and keeps the
/// shared [`UpstreamPool`] in sync with it. This is the single point
/// through which a new configuration — from the admin API via the
/// `Store`, from a YAML file via the `ConfigSource`, or from a test —
/// becomes live traffic-serving state.
pub struct ConfigStore {
    matcher: RwLock<Arc<RouteMatcher>>,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    pool: Arc<UpstreamPool>,
    version: AtomicU64,
    change_tx: watch::Sender<u64>,
}

impl ConfigStore {
    pub fn new(pool: Arc<UpstreamPool>) -> Arc<Self> {
        let (change_tx, _rx) = watch::channel(0);
        Arc::new(Self {
            matcher: RwLock::new(Arc::new(RouteMatcher::new(Vec::new()).expect("empty route set always compiles"))),
            snapshot: RwLock::new(Arc::new(ConfigSnapshot::empty())),
            pool,
            version: AtomicU64::new(0),
            change_tx,
        })
    }

    /// Validates, compiles and installs `snapshot` as the new live
    /// configuration. On any failure the previous snapshot keeps
    /// serving traffic untouched.
    pub fn install(&self, mut snapshot: ConfigSnapshot) -> Result<(), InstallError> {
        let report = ConfigValidator::validate(&snapshot);
        if !report.is_valid() {
            return Err(InstallError::Invalid(report.errors));
        }

        let next_version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot.version = next_version;

        let matcher = RouteMatcher::new(snapshot.routes.clone())?;

        self.pool.install(&snapshot.upstreams);
        *self.matcher.write().expect("matcher lock poisoned") = Arc::new(matcher);
        *self.snapshot.write().expect("snapshot lock poisoned") = Arc::new(snapshot);

        let _ = self.change_tx.send(next_version);
        Ok(())
    }

    /// The matcher snapshot in-flight requests should hold for their
    /// entire lifetime (spec.md §3 "In-flight requests continue on the
    /// snapshot they started with").
    pub fn current_matcher(&self) -> Arc<RouteMatcher> {
        self.matcher.read().expect("matcher lock poisoned").clone()
    }

    pub fn current_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::{PathMatch, PathMatchType, Route, Rule};
    use crate::models::upstream::{Algorithm, Target, Upstream};
    use chrono::Utc;
    use std::collections::HashMap;

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

    fn route(id: &str, upstream_id: &str) -> Route {
        Route {
            id: id.to_string(),
            name: id.to_string(),
            priority: 0,
            upstream_id: upstream_id.to_string(),
            metadata: HashMap::new(),
            rule: Rule {
                paths: vec![PathMatch { match_type: PathMatchType::Prefix, value: "/".to_string() }],
                ..Default::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn valid_install_bumps_version_and_becomes_current() {
        let store = ConfigStore::new(Arc::new(UpstreamPool::new()));
        let mut snapshot = ConfigSnapshot::empty();
        snapshot.upstreams.insert("u1".to_string(), Arc::new(upstream("u1")));
        snapshot.routes.push(route("r1", "u1"));

        store.install(snapshot).unwrap();
        assert_eq!(store.version(), 1);
        assert_eq!(store.current_matcher().len(), 1);
    }

    #[test]
    fn invalid_install_does_not_disturb_previous_snapshot() {
        let store = ConfigStore::new(Arc::new(UpstreamPool::new()));
        let mut good = ConfigSnapshot::empty();
        good.upstreams.insert("u1".to_string(), Arc::new(upstream("u1")));
        good.routes.push(route("r1", "u1"));
        store.install(good).unwrap();
        assert_eq!(store.version(), 1);

        let mut bad = ConfigSnapshot::empty();
        bad.routes.push(route("r2", "missing-upstream"));
        let err = store.install(bad);
        assert!(err.is_err());

        assert_eq!(store.version(), 1);
        assert_eq!(store.current_matcher().len(), 1);
    }
}
