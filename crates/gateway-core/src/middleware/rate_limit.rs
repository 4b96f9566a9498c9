//! Fixed-window rate limiting (spec.md §4.6.2).
//!
//! Each derived key maps to a `{windowStart, count}` cell; a request is
//! allowed iff incrementing the count does not exceed `MaxRequests`
//! within `WindowSize`. Cells are sharded behind a `RwLock<HashMap>` —
//! the simplest discipline that still gives the per-key atomicity the
//! spec requires (spec.md §5 "Rate limiter: per-key cell under a
//! sharded mutex or an atomic compare-and-swap loop").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval;

/// Key derivation strategy (spec.md GLOSSARY "Key (rate limiter)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Ip,
    User,
    ApiKey,
    Combined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub key_strategy: KeyStrategy,
    pub max_requests: u64,
    pub window_secs: u64,
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_strategy: KeyStrategy::Ip,
            max_requests: 100,
            window_secs: 60,
            cleanup_interval_secs: default_cleanup_secs(),
        }
    }
}

struct Cell {
    window_start: Instant,
    count: u64,
    last_touched: Instant,
}

/// The decision for one request, and the headers the spec requires on
/// every response regardless of outcome (spec.md §4.6.2 "Response
/// headers ... are always set").
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window resets.
    pub reset_at: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    cells: Mutex<HashMap<String, Cell>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, cells: Mutex::new(HashMap::new()) }
    }

    /// Derives the bucketing key from the available identity facets.
    /// `Combined` concatenates every facet present so that, e.g., an
    /// authenticated user is still distinguished per source IP.
    pub fn derive_key(&self, ip: Option<&str>, user: Option<&str>, api_key: Option<&str>) -> String {
        match self.config.key_strategy {
            KeyStrategy::Ip => ip.unwrap_or("unknown").to_string(),
            KeyStrategy::User => user.unwrap_or("anonymous").to_string(),
            KeyStrategy::ApiKey => api_key.unwrap_or("none").to_string(),
            KeyStrategy::Combined => format!(
                "{}|{}|{}",
                ip.unwrap_or("-"),
                user.unwrap_or("-"),
                api_key.unwrap_or("-")
            ),
        }
    }

    /// Increments the window's count and decides whether the request is
    /// admitted (spec.md §4.6.2 "a request is allowed iff incrementing
    /// does not exceed `MaxRequests` within `WindowSize`").
    pub fn check(&self, key: &str) -> Decision {
        let window = Duration::from_secs(self.config.window_secs.max(1));
        let now = Instant::now();
        let mut cells = self.cells.lock().expect("rate limiter mutex poisoned");

        let cell = cells.entry(key.to_string()).or_insert_with(|| Cell {
            window_start: now,
            count: 0,
            last_touched: now,
        });

        if now.duration_since(cell.window_start) >= window {
            cell.window_start = now;
            cell.count = 0;
        }
        cell.last_touched = now;

        let would_be = cell.count + 1;
        let allowed = would_be <= self.config.max_requests;
        if allowed {
            cell.count = would_be;
        }

        let remaining = self.config.max_requests.saturating_sub(cell.count);
        let reset_at = instant_to_unix_secs(cell.window_start + window);

        Decision { allowed, limit: self.config.max_requests, remaining, reset_at }
    }

    /// Periodic sweep dropping cells idle longer than
    /// `CleanupInterval` (spec.md §4.6.2 "A background sweep deletes
    /// cells idle for longer than `CleanupInterval`").
    pub fn spawn_cleanup_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let sweep_every = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
            let mut ticker = interval(sweep_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let idle_after = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
                        let now = Instant::now();
                        let mut cells = self.cells.lock().expect("rate limiter mutex poisoned");
                        cells.retain(|_, cell| now.duration_since(cell.last_touched) < idle_after);
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

/// `Instant` has no epoch, so the reset timestamp is approximated
/// relative to wall-clock "now" at call time — acceptable since the
/// header is advisory, not used for internal bookkeeping.
fn instant_to_unix_secs(target: Instant) -> u64 {
    let now_instant = Instant::now();
    let now_unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if target >= now_instant {
        now_unix + (target - now_instant).as_secs()
    } else {
        now_unix.saturating_sub((now_instant - target).as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_requests_then_rejects() {
        let limiter = RateLimiter::new(RateLimitConfig { max_requests: 3, window_secs: 60, ..Default::default() });
        for i in 0..3 {
            let d = limiter.check("x");
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, 2 - i);
        }
        let d = limiter.check("x");
        assert!(!d.allowed);
    }

    #[test]
    fn distinct_keys_have_independent_windows() {
        let limiter = RateLimiter::new(RateLimitConfig { max_requests: 1, window_secs: 60, ..Default::default() });
        assert!(limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
        assert!(!limiter.check("a").allowed);
    }

    #[test]
    fn combined_key_includes_every_facet() {
        let limiter = RateLimiter::new(RateLimitConfig { key_strategy: KeyStrategy::Combined, ..Default::default() });
        let key = limiter.derive_key(Some("1.2.3.4"), Some("alice"), Some("key-1"));
        assert!(key.contains("1.2.3.4"));
        assert!(key.contains("alice"));
        assert!(key.contains("key-1"));
    }
}
