//! Load-balancer set (spec.md §4.2).
//!
//! One strategy per `Algorithm`. Every strategy is keyed per-upstream by
//! [`crate::pool::UpstreamPool`], which owns the mutable per-upstream
//! state (atomic counters, smoothed weights) the strategies below
//! operate on — generalized from the teacher's stateless-per-call
//! `services::load_balancer` strategies, which kept counters on the
//! balancer instance itself rather than per upstream.

pub mod canary;
pub mod ip_hash;
pub mod round_robin;
pub mod weighted;

use thiserror::Error;

use crate::models::upstream::Target;

/// Errors from a selection attempt (spec.md §4.2 contract:
/// `Select(upstreamID, request) → target | NoHealthyTarget | UnknownUpstream`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("no healthy target for upstream {upstream_id}")]
    NoHealthyTarget { upstream_id: String },
    #[error("unknown upstream {upstream_id}")]
    UnknownUpstream { upstream_id: String },
}

/// Context a selection needs beyond the healthy target list itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectContext<'a> {
    pub client_ip: Option<&'a str>,
}

/// A load-balancing strategy's per-upstream mutable state and selection
/// logic. Implementations must be safe for concurrent callers
/// (spec.md §4.2 "Selection is safe for concurrent callers") and must
/// never block (spec.md §5 "No suspension is permitted inside the fast
/// path ... of selection").
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// `healthy` is the current healthy subset, in the upstream's
    /// declared target order. Returns `None` iff `healthy` is empty.
    fn select<'t>(&self, healthy: &[&'t Target], ctx: SelectContext<'_>) -> Option<&'t Target>;
}
