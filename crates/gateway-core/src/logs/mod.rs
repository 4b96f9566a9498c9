//! Logging setup (ambient stack — see `SPEC_FULL.md` §A).
//!
//! The library never initializes a logger itself; [`logger::configure_logger`]
//! is called once by the `gateway-server` binary entry point.

pub mod logger;
