//! Passive health checker (spec.md §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{watch, RwLock};
use tokio::time::interval;

use crate::health::HealthCallback;
use crate::pool::{HealthView, UpstreamPool};

/// Policy knobs (spec.md §4.4 "Policy").
#[derive(Debug, Clone)]
pub struct PassiveCheckConfig {
    pub consecutive_failures: u32,
    pub isolation_duration: Duration,
    pub consecutive_successes: u32,
    /// Status code ranges (inclusive) treated as failures. Defaults to 5xx.
    pub failure_status_ranges: Vec<(u16, u16)>,
    pub timeout_as_failure: bool,
    pub recovery_interval: Duration,
}

impl Default for PassiveCheckConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            isolation_duration: Duration::from_secs(30),
            consecutive_successes: 1,
            failure_status_ranges: vec![(500, 599)],
            timeout_as_failure: true,
            recovery_interval: Duration::from_secs(10),
        }
    }
}

impl PassiveCheckConfig {
    fn is_failure_status(&self, status: u16) -> bool {
        self.failure_status_ranges.iter().any(|(lo, hi)| status >= *lo && status <= *hi)
    }
}

#[derive(Debug)]
struct TargetStats {
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    isolated_at: RwLock<Option<Instant>>,
}

impl TargetStats {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            isolated_at: RwLock::new(None),
        }
    }
}

/// A single outbound-request outcome, as reported by the reverse proxy
/// (spec.md §4.4 contract).
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    pub status_code: Option<u16>,
    pub is_timeout: bool,
    pub is_error: bool,
}

impl Outcome {
    pub fn success(status_code: u16) -> Self {
        Self { status_code: Some(status_code), is_timeout: false, is_error: false }
    }

    pub fn timeout() -> Self {
        Self { status_code: None, is_timeout: true, is_error: false }
    }

    pub fn connection_error() -> Self {
        Self { status_code: None, is_timeout: false, is_error: true }
    }
}

/// Observes live request outcomes reported by the proxy and isolates or
/// recovers targets accordingly. Independent from
/// [`super::active::ActiveHealthChecker`] — each checker owns its own
/// view on [`crate::models::upstream::Target`], and
/// [`crate::pool::UpstreamPool`] composes them with a logical AND, so
/// either checker's isolation call is sticky until that same checker
/// clears it.
pub struct PassiveHealthChecker {
    pool: Arc<UpstreamPool>,
    config: PassiveCheckConfig,
    stats: RwLock<HashMap<String, Arc<TargetStats>>>,
    callback: Option<HealthCallback>,
}

impl PassiveHealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, config: PassiveCheckConfig) -> Self {
        Self { pool, config, stats: RwLock::new(HashMap::new()), callback: None }
    }

    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn stats_key(upstream_id: &str, target_key: &str) -> String {
        format!("{upstream_id}/{target_key}")
    }

    /// Records one outbound outcome, possibly isolating or recovering
    /// the target.
    pub async fn report(&self, upstream_id: &str, target_key: &str, outcome: Outcome) {
        let failed = outcome.is_error
            || (outcome.is_timeout && self.config.timeout_as_failure)
            || outcome.status_code.map(|c| self.config.is_failure_status(c)).unwrap_or(false);

        let key = Self::stats_key(upstream_id, target_key);
        let stats = {
            let mut map = self.stats.write().await;
            map.entry(key).or_insert_with(|| Arc::new(TargetStats::new())).clone()
        };

        if failed {
            stats.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            let already_isolated = stats.isolated_at.read().await.is_some();
            if failures >= self.config.consecutive_failures && !already_isolated {
                *stats.isolated_at.write().await = Some(Instant::now());
                self.flip(upstream_id, target_key, false).await;
                warn!("passive health check isolated {upstream_id}/{target_key} after {failures} consecutive failures");
            }
            return;
        }

        stats.consecutive_failures.store(0, Ordering::Relaxed);
        let successes = stats.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;

        let isolated_since = *stats.isolated_at.read().await;
        if let Some(since) = isolated_since {
            if successes >= self.config.consecutive_successes && since.elapsed() >= self.config.isolation_duration {
                *stats.isolated_at.write().await = None;
                self.flip(upstream_id, target_key, true).await;
                info!("passive health check recovered {upstream_id}/{target_key}");
            }
        }
    }

    async fn flip(&self, upstream_id: &str, target_key: &str, healthy: bool) {
        if let Some((host, port)) = target_key.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                self.pool.set_target_health(upstream_id, host, port, HealthView::Passive, healthy);
            }
        }
        if let Some(cb) = &self.callback {
            cb(upstream_id, target_key, healthy);
        }
    }

    /// Periodic sweep (spec.md §4.4 "Recovery loop"): resets
    /// `consecutiveSuccesses` to zero for isolated targets whose
    /// isolation window has expired, so the next successful request
    /// starts a clean recovery count rather than carrying over stale
    /// successes observed mid-isolation.
    pub fn spawn_recovery_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.recovery_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot: Vec<(String, Arc<TargetStats>)> = {
                            let map = self.stats.read().await;
                            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                        };
                        for (_, stats) in snapshot {
                            let expired = match *stats.isolated_at.read().await {
                                Some(since) => since.elapsed() >= self.config.isolation_duration,
                                None => false,
                            };
                            if expired {
                                stats.consecutive_successes.store(0, Ordering::Relaxed);
                            }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(cfg: PassiveCheckConfig) -> PassiveHealthChecker {
        PassiveHealthChecker::new(Arc::new(UpstreamPool::new()), cfg)
    }

    #[tokio::test]
    async fn isolates_after_n_consecutive_failures() {
        let cfg = PassiveCheckConfig { consecutive_failures: 3, ..Default::default() };
        let checker = checker(cfg);
        for _ in 0..2 {
            checker.report("u", "a:1", Outcome::success(500)).await;
        }
        let key = PassiveHealthChecker::stats_key("u", "a:1");
        let stats = checker.stats.read().await.get(&key).unwrap().clone();
        assert!(stats.isolated_at.read().await.is_none());

        checker.report("u", "a:1", Outcome::success(500)).await;
        assert!(stats.isolated_at.read().await.is_some());
    }

    #[tokio::test]
    async fn default_treats_5xx_and_timeout_as_failure_not_4xx() {
        let checker = checker(PassiveCheckConfig { consecutive_failures: 1, ..Default::default() });
        checker.report("u", "a:1", Outcome::success(404)).await;
        let key = PassiveHealthChecker::stats_key("u", "a:1");
        let stats = checker.stats.read().await.get(&key).unwrap().clone();
        assert!(stats.isolated_at.read().await.is_none(), "4xx must not isolate");

        checker.report("u", "a:1", Outcome::timeout()).await;
        assert!(stats.isolated_at.read().await.is_some(), "timeout must isolate");
    }
}
