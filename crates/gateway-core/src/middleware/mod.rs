//! The middleware chain (spec.md §4.6): authentication, fixed-window
//! rate limiting, the mock responder, traffic mirroring and metrics,
//! composed once per configuration snapshot by [`chain::MiddlewareChain`]
//! and invoked in order by [`crate::gateway::Gateway`].

pub mod auth;
pub mod chain;
pub mod metrics;
pub mod mirror;
pub mod mock;
pub mod rate_limit;
