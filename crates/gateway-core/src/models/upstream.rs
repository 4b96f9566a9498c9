//! Upstream, Target and HealthCheck entities (spec.md §3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::error::ModelError;

/// Selection algorithm bound to an upstream (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    WeightedRoundRobin,
    IpHash,
    Canary,
}

/// Probe type for an active health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    Http,
    Tcp,
}

/// Active probe configuration bound to an upstream (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    #[serde(default = "default_path")]
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

fn default_path() -> String {
    "/".to_string()
}

impl HealthCheck {
    pub fn validate(&self) -> bool {
        self.interval_secs >= 1
            && self.timeout_secs >= 1
            && self.healthy_threshold >= 1
            && self.unhealthy_threshold >= 1
    }
}

/// A single network endpoint bound to an upstream (spec.md §3 "Target").
///
/// The externally-visible healthy flag is the logical AND of two
/// independently-maintained views (spec.md §4.4 "Composition rule"):
/// [`ActiveHealthChecker`](crate::health::active::ActiveHealthChecker)'s
/// hysteresis state machine and
/// [`PassiveHealthChecker`](crate::health::passive::PassiveHealthChecker)'s
/// outcome-driven isolation. Each view owns its own atomic and only ever
/// writes that one, so either checker's "unhealthy" call stays sticky
/// until that same view clears it — the other view flipping back to
/// healthy can never silently un-isolate a target the other view still
/// considers down.
#[derive(Debug, Serialize, Deserialize)]
#[serde(from = "TargetWire", into = "TargetWire")]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub priority: u32,
    active_healthy: AtomicBool,
    passive_healthy: AtomicBool,
    pub zone: Option<String>,
    pub region: Option<String>,
    pub version: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Wire shape for `Target`: a single declared `healthy` bool, the seed
/// value for both the active and passive views (spec.md §4.3 "Initial
/// state follows the declared `Target.Healthy`").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetWire {
    host: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: u32,
    #[serde(default)]
    priority: u32,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

impl From<TargetWire> for Target {
    fn from(w: TargetWire) -> Self {
        Self {
            host: w.host,
            port: w.port,
            weight: w.weight,
            priority: w.priority,
            active_healthy: AtomicBool::new(w.healthy),
            passive_healthy: AtomicBool::new(w.healthy),
            zone: w.zone,
            region: w.region,
            version: w.version,
            metadata: w.metadata,
        }
    }
}

impl From<Target> for TargetWire {
    fn from(t: Target) -> Self {
        Self {
            host: t.host,
            port: t.port,
            weight: t.weight,
            priority: t.priority,
            healthy: t.is_healthy(),
            zone: t.zone,
            region: t.region,
            version: t.version,
            metadata: t.metadata,
        }
    }
}

impl Clone for Target {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            weight: self.weight,
            priority: self.priority,
            active_healthy: AtomicBool::new(self.is_active_healthy()),
            passive_healthy: AtomicBool::new(self.is_passive_healthy()),
            zone: self.zone.clone(),
            region: self.region.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
            priority: 0,
            active_healthy: AtomicBool::new(true),
            passive_healthy: AtomicBool::new(true),
            zone: None,
            region: None,
            version: None,
            metadata: HashMap::new(),
        }
    }

    /// Seeds both views with the same declared value; used by
    /// discovery drivers constructing a `Target` from an `Instance`.
    pub fn with_healthy(self, healthy: bool) -> Self {
        self.active_healthy.store(healthy, Ordering::Relaxed);
        self.passive_healthy.store(healthy, Ordering::Relaxed);
        self
    }

    /// The composed, externally-visible flag: healthy only when both
    /// the active and passive views agree (spec.md §4.4 "Composition
    /// rule").
    pub fn is_healthy(&self) -> bool {
        self.is_active_healthy() && self.is_passive_healthy()
    }

    pub fn is_active_healthy(&self) -> bool {
        self.active_healthy.load(Ordering::Acquire)
    }

    pub fn is_passive_healthy(&self) -> bool {
        self.passive_healthy.load(Ordering::Acquire)
    }

    pub fn set_active_healthy(&self, healthy: bool) {
        self.active_healthy.store(healthy, Ordering::Release);
    }

    pub fn set_passive_healthy(&self, healthy: bool) {
        self.passive_healthy.store(healthy, Ordering::Release);
    }

    /// Weight 0 is treated as weight 1 for RR/WRR selection (spec.md §8
    /// "Boundary behaviors"); IP-hash excludes weight-0 targets entirely.
    pub fn effective_weight(&self) -> u32 {
        if self.weight == 0 {
            1
        } else {
            self.weight
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// A named backend: targets plus algorithm plus optional health check
/// (spec.md §3 "Upstream").
#[derive(Debug, Serialize, Deserialize)]
pub struct Upstream {
    pub id: String,
    pub algorithm: Algorithm,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    /// Fraction (0.0..=1.0) of traffic routed to the canary subset when
    /// `algorithm == Canary` (spec.md §4.2 "Canary").
    #[serde(default)]
    pub canary_fraction: Option<f64>,
    /// Keys (in `host:port` form) treated as the canary subset.
    #[serde(default)]
    pub canary_targets: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upstream {
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if target.port == 0 {
                return Err(ModelError::InvalidPort {
                    id: self.id.clone(),
                    port: target.port as u32,
                });
            }
            if !seen.insert((target.host.clone(), target.port)) {
                return Err(ModelError::DuplicateTarget {
                    id: self.id.clone(),
                    host: target.host.clone(),
                    port: target.port,
                });
            }
        }
        if let Some(hc) = &self.health_check {
            if !hc.validate() {
                return Err(ModelError::InvalidHealthCheck { id: self.id.clone() });
            }
        }
        Ok(())
    }

    /// Targets currently admissible for selection.
    pub fn healthy_targets(&self) -> Vec<&Target> {
        self.targets.iter().filter(|t| t.is_healthy()).collect()
    }
}
