//! Resolver target parsing
//!
//! Accepted forms: `host[:port]/service[?tag=env]`, optionally prefixed
//! with `consul://`. Malformed input is rejected before any network call.

use std::fmt;

use tessera_common::{
    DEFAULT_DISCOVERY_PORT, DISCOVERY_SCHEME, is_valid_host, is_valid_service_name,
};

use crate::error::{DiscoveryError, Result};
use crate::model::Address;

/// Parsed resolver target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Discovery backend agent address
    pub backend: Address,
    /// Service whose healthy instances are resolved
    pub service_name: String,
    /// Tag filter applied to the health query
    pub environment_tag: Option<String>,
}

impl Target {
    /// Parse a target, using `default_tag` unless the URI carries `?tag=`
    pub fn parse(uri: &str, default_tag: Option<&str>) -> Result<Self> {
        let invalid = |reason: &str| DiscoveryError::invalid_target(uri, reason);

        let rest = match uri.split_once("://") {
            Some((scheme, rest)) if scheme == DISCOVERY_SCHEME => rest,
            Some((scheme, _)) => {
                return Err(invalid(&format!("unsupported scheme '{}'", scheme)));
            }
            None => uri,
        };

        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing '/service-name'"))?;

        let (name, query) = match path.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (path, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        if !is_valid_host(host) {
            return Err(invalid("malformed host"));
        }

        let port = match port {
            None => DEFAULT_DISCOVERY_PORT,
            Some(p) => parse_port(p).ok_or_else(|| invalid("port must be a number in 1-65535"))?,
        };

        if name.is_empty() {
            return Err(invalid("missing service name"));
        }
        if !is_valid_service_name(name) {
            return Err(invalid("malformed service name"));
        }

        let mut environment_tag = default_tag.filter(|t| !t.is_empty()).map(str::to_string);
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                if let Some(("tag", value)) = pair.split_once('=') {
                    environment_tag = Some(value.to_string()).filter(|t| !t.is_empty());
                }
            }
        }

        Ok(Self {
            backend: Address::new(host, port),
            service_name: name.to_string(),
            environment_tag,
        })
    }

    /// Canonical URI of this target
    pub fn uri(&self) -> String {
        format!("{}://{}/{}", DISCOVERY_SCHEME, self.backend, self.service_name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())?;
        if let Some(tag) = &self.environment_tag {
            write!(f, "?tag={}", tag)?;
        }
        Ok(())
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    if raw.is_empty() || raw.len() > 5 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u16>().ok().filter(|p| *p != 0)
}
