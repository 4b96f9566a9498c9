//! Active and passive health checking (spec.md §4.3, §4.4).
//!
//! Generalizes the teacher's `services::circuit_breaker` hysteresis
//! pattern (atomic state, consecutive counters, `tokio::sync::RwLock`
//! for the rarely-written timestamp) into the two independent views the
//! spec calls for: a periodic prober and an outcome-driven observer.
//! Each flips only its own view — [`crate::models::upstream::Target::set_active_healthy`]
//! or [`crate::models::upstream::Target::set_passive_healthy`] respectively —
//! and neither owns the target list.

pub mod active;
pub mod passive;

/// A health transition callback: `(upstream_id, target_key, healthy)`.
/// Only fired on an actual state change (spec.md §4.3 "Only state
/// changes emit callbacks").
pub type HealthCallback = std::sync::Arc<dyn Fn(&str, &str, bool) + Send + Sync>;
