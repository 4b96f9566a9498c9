//! Small helpers shared across components that would otherwise be
//! duplicated: outbound URL formatting, client IP extraction and the
//! FNV-1a hash the IP-hash balancer uses.

pub mod fnv;
pub mod ip;
pub mod path;
