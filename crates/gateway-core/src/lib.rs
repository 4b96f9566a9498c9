//! API gateway data plane: route matching, load balancing, active and
//! passive health checking, service discovery, configuration hot-reload
//! and the authentication/rate-limit/mock/mirror/metrics middleware
//! chain (see `SPEC_FULL.md` for the full module breakdown).
//!
//! [`gateway::Gateway`] is the composition root `gateway-server` builds
//! once at startup; everything else in this crate is a collaborator it
//! owns or a plain-data type the collaborators exchange.

pub mod balancer;
pub mod config;
pub mod discovery;
pub mod gateway;
pub mod health;
pub mod logs;
pub mod matcher;
pub mod middleware;
pub mod models;
pub mod pool;
pub mod proxy;
pub mod utils;

pub use gateway::{Gateway, GatewayHealth};
