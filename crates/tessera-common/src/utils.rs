//! Utility functions for Tessera
//!
//! Common helper functions used across the codebase.

use std::sync::LazyLock;
use std::time::Duration;

use if_addrs::IfAddr;

/// Pattern for service names: leading letter, then letters, digits, underscore or hyphen
static SERVICE_NAME_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new("^[A-Za-z][A-Za-z0-9_-]*$").expect("Invalid regex pattern")
});

/// Pattern for backend hosts: DNS names and IPv4 literals
static HOST_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[A-Za-z0-9.-]+$").expect("Invalid regex pattern"));

/// Validate a service name
///
/// # Examples
///
/// ```
/// use tessera_common::is_valid_service_name;
///
/// assert!(is_valid_service_name("orders"));
/// assert!(is_valid_service_name("order_api-v2"));
/// assert!(!is_valid_service_name("orders/v1"));
/// assert!(!is_valid_service_name(""));
/// ```
pub fn is_valid_service_name(name: &str) -> bool {
    SERVICE_NAME_PATTERN.is_match(name)
}

/// Validate a backend host name or IPv4 literal
pub fn is_valid_host(host: &str) -> bool {
    HOST_PATTERN.is_match(host)
}

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
///
/// # Examples
///
/// ```
/// use tessera_common::local_ip;
///
/// let ip = local_ip();
/// assert!(!ip.is_empty());
/// ```
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Format a duration the way the discovery backend parses it ("10s", "1500ms")
///
/// Whole seconds are rendered in seconds, anything else in milliseconds.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis().max(1))
    }
}
