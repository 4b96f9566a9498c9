//! Active health checker (spec.md §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::interval;

use crate::health::HealthCallback;
use crate::models::upstream::{HealthCheck, HealthCheckType, Target};
use crate::pool::{HealthView, UpstreamPool};

#[derive(Debug)]
struct TargetState {
    healthy: AtomicBool,
    consecutive_success: AtomicU32,
    consecutive_failure: AtomicU32,
}

impl TargetState {
    fn new(initial_healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(initial_healthy),
            consecutive_success: AtomicU32::new(0),
            consecutive_failure: AtomicU32::new(0),
        }
    }
}

/// Probes every target of every configured upstream on its own interval,
/// flipping `Target::healthy` through the consecutive-success/failure
/// hysteresis described in spec.md §4.3.
pub struct ActiveHealthChecker {
    pool: Arc<UpstreamPool>,
    http_client: reqwest::Client,
    callback: Option<HealthCallback>,
}

impl ActiveHealthChecker {
    pub fn new(pool: Arc<UpstreamPool>, http_client: reqwest::Client) -> Self {
        Self { pool, http_client, callback: None }
    }

    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Spawns the periodic driver for one upstream. Fires an immediate
    /// first pass (spec.md §4.3 "it fires an immediate first pass on
    /// start"), then probes every target concurrently on each tick.
    /// Exits when `shutdown` is signalled, draining any in-flight probe
    /// round before returning (spec.md §4.3 "Shutdown drains all
    /// in-flight probes").
    pub fn spawn_driver(
        self: Arc<Self>,
        upstream_id: String,
        check: HealthCheck,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut states: HashMap<String, TargetState> = HashMap::new();
            let mut ticker = interval(Duration::from_secs(check.interval_secs.max(1)));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe_round(&upstream_id, &check, &mut states).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("active health checker for {upstream_id} shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn probe_round(&self, upstream_id: &str, check: &HealthCheck, states: &mut HashMap<String, TargetState>) {
        let Some(targets) = self.pool.targets(upstream_id) else {
            return;
        };

        let live_keys: std::collections::HashSet<String> = targets.iter().map(Target::key).collect();
        states.retain(|k, _| live_keys.contains(k));

        let futures = targets.into_iter().map(|target| {
            let check = check.clone();
            let client = self.http_client.clone();
            async move {
                let ok = Self::probe_one(&client, &target, &check).await;
                (target, ok)
            }
        });

        let results = futures::future::join_all(futures).await;

        for (target, ok) in results {
            let key = target.key();
            let state = states.entry(key.clone()).or_insert_with(|| TargetState::new(target.is_healthy()));
            self.apply_outcome(upstream_id, &key, ok, check, state);
        }
    }

    fn apply_outcome(&self, upstream_id: &str, key: &str, success: bool, check: &HealthCheck, state: &TargetState) {
        let was_healthy = state.healthy.load(Ordering::Acquire);
        let mut transitioned = None;

        if success {
            state.consecutive_failure.store(0, Ordering::Relaxed);
            let successes = state.consecutive_success.fetch_add(1, Ordering::Relaxed) + 1;
            if !was_healthy && successes >= check.healthy_threshold {
                state.healthy.store(true, Ordering::Release);
                transitioned = Some(true);
            }
        } else {
            state.consecutive_success.store(0, Ordering::Relaxed);
            let failures = state.consecutive_failure.fetch_add(1, Ordering::Relaxed) + 1;
            if was_healthy && failures >= check.unhealthy_threshold {
                state.healthy.store(false, Ordering::Release);
                transitioned = Some(false);
            }
        }

        if let Some(healthy) = transitioned {
            if let Some((host, port)) = key.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    self.pool.set_target_health(upstream_id, host, port, HealthView::Active, healthy);
                }
            }
            if healthy {
                info!("active health check: {upstream_id}/{key} -> healthy");
            } else {
                warn!("active health check: {upstream_id}/{key} -> unhealthy");
            }
            if let Some(cb) = &self.callback {
                cb(upstream_id, key, healthy);
            }
        }
    }

    async fn probe_one(client: &reqwest::Client, target: &Target, check: &HealthCheck) -> bool {
        let timeout = Duration::from_secs(check.timeout_secs.max(1));
        match check.check_type {
            HealthCheckType::Http => {
                let url = format!("http://{}:{}{}", target.host, target.port, check.path);
                match tokio::time::timeout(timeout, client.get(&url).send()).await {
                    Ok(Ok(resp)) => (200..300).contains(&resp.status().as_u16()),
                    _ => false,
                }
            }
            HealthCheckType::Tcp => {
                let addr = format!("{}:{}", target.host, target.port);
                matches!(
                    tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(healthy_threshold: u32, unhealthy_threshold: u32) -> HealthCheck {
        HealthCheck {
            check_type: HealthCheckType::Http,
            path: "/health".to_string(),
            interval_secs: 5,
            timeout_secs: 1,
            healthy_threshold,
            unhealthy_threshold,
        }
    }

    fn checker() -> ActiveHealthChecker {
        ActiveHealthChecker::new(Arc::new(UpstreamPool::new()), reqwest::Client::new())
    }

    #[test]
    fn healthy_target_flips_only_after_unhealthy_threshold_consecutive_failures() {
        let hc = checker();
        let cfg = check(1, 2);
        let state = TargetState::new(true);

        hc.apply_outcome("u", "t", false, &cfg, &state);
        assert!(state.healthy.load(Ordering::Acquire), "single failure must not flip");

        hc.apply_outcome("u", "t", false, &cfg, &state);
        assert!(!state.healthy.load(Ordering::Acquire), "second consecutive failure must flip");
    }

    #[test]
    fn unhealthy_target_recovers_after_healthy_threshold_consecutive_successes() {
        let hc = checker();
        let cfg = check(2, 1);
        let state = TargetState::new(false);

        hc.apply_outcome("u", "t", true, &cfg, &state);
        assert!(!state.healthy.load(Ordering::Acquire), "single success must not recover");

        hc.apply_outcome("u", "t", true, &cfg, &state);
        assert!(state.healthy.load(Ordering::Acquire), "second consecutive success must recover");
    }

    #[test]
    fn alternating_outcomes_reset_the_opposite_counter() {
        let hc = checker();
        let cfg = check(1, 3);
        let state = TargetState::new(true);

        hc.apply_outcome("u", "t", false, &cfg, &state);
        hc.apply_outcome("u", "t", true, &cfg, &state);
        assert_eq!(state.consecutive_failure.load(Ordering::Relaxed), 0);
        hc.apply_outcome("u", "t", false, &cfg, &state);
        hc.apply_outcome("u", "t", false, &cfg, &state);
        assert!(state.healthy.load(Ordering::Acquire), "only 2 of 3 needed consecutive failures so far");
    }
}
