//! Tessera Common - Shared helpers used across the Tessera crates
//!
//! - Exponential backoff with jitter
//! - Identifier and host validation
//! - Local address discovery
//! - Duration formatting for backend wire formats

pub mod backoff;
pub mod utils;

pub use backoff::BackoffConfig;
pub use utils::{format_duration, is_valid_host, is_valid_service_name, local_ip};

/// Default port of the discovery backend agent
pub const DEFAULT_DISCOVERY_PORT: u16 = 8500;

/// URI scheme used by the discovery-backed resolver
pub const DISCOVERY_SCHEME: &str = "consul";
