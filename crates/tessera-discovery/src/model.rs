//! Discovery data model
//!
//! Domain types shared by the registrar and resolvers, plus the JSON shapes
//! of the backend's agent and health endpoints.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_common::format_duration;

/// Registration descriptor of the local instance
///
/// Built once at startup and never mutated. The id is derived from
/// name, address and port so repeated registrations overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub id: String,
    pub address: String,
    pub port: u16,
    pub tags: BTreeSet<String>,
    pub health_check_interval: Duration,
    pub deregister_after: Duration,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let address = address.into();
        Self {
            id: Self::instance_id(&name, &address, port),
            name,
            address,
            port,
            tags: BTreeSet::new(),
            health_check_interval: Duration::from_secs(10),
            deregister_after: Duration::from_secs(60),
        }
    }

    /// Deterministic registration id: `{name}-{address}-{port}`
    pub fn instance_id(name: &str, address: &str, port: u16) -> String {
        format!("{}-{}-{}", name, address, port)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_deregister_after(mut self, after: Duration) -> Self {
        self.deregister_after = after;
        self
    }

    /// gRPC health-check target polled by the backend
    pub fn grpc_check_target(&self) -> String {
        format!("{}:{}/{}", self.address, self.port, self.name)
    }

    /// Agent registration body for this descriptor
    pub fn to_registration(&self) -> AgentServiceRegistration {
        AgentServiceRegistration {
            id: self.id.clone(),
            name: self.name.clone(),
            tags: self.tags.iter().cloned().collect(),
            address: self.address.clone(),
            port: self.port,
            check: Some(AgentServiceCheck {
                grpc: Some(self.grpc_check_target()),
                interval: Some(format_duration(self.health_check_interval)),
                deregister_critical_service_after: Some(format_duration(self.deregister_after)),
                ..Default::default()
            }),
        }
    }
}

/// Opaque, monotonically non-decreasing change index of the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchCursor(u64);

impl WatchCursor {
    pub const ZERO: WatchCursor = WatchCursor(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Next cursor to supply after a response reporting `returned`
    ///
    /// An index that goes backwards means the backend state was reset, so
    /// the watch restarts from zero instead of blocking on a stale index.
    /// A zero index is never used for blocking and is bumped to one.
    pub fn advance(self, returned: WatchCursor) -> WatchCursor {
        if returned.is_zero() {
            WatchCursor(1)
        } else if returned < self {
            Self::ZERO
        } else {
            returned
        }
    }
}

impl fmt::Display for WatchCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One resolved endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Full set of endpoints for one target, replaced wholesale on every push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: Vec<Address>,
}

impl AddressSet {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn into_inner(self) -> Vec<Address> {
        self.addresses
    }
}

impl From<Vec<Address>> for AddressSet {
    fn from(addresses: Vec<Address>) -> Self {
        Self::new(addresses)
    }
}

impl fmt::Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, addr) in self.addresses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", addr)?;
        }
        write!(f, "]")
    }
}

/// A healthy instance returned by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl ServiceInstance {
    pub fn endpoint(&self) -> Address {
        Address::new(self.address.clone(), self.port)
    }
}

/// Blocking query for healthy instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthQuery {
    pub service: String,
    pub tag: Option<String>,
    pub cursor: WatchCursor,
    /// Long-poll timeout requested from the backend
    pub wait: Duration,
}

impl HealthQuery {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tag: None,
            cursor: WatchCursor::ZERO,
            wait: Duration::from_secs(300),
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_cursor(mut self, cursor: WatchCursor) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// Result of a health query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthyInstances {
    pub instances: Vec<ServiceInstance>,
    pub cursor: WatchCursor,
}

impl HealthyInstances {
    pub fn address_set(&self) -> AddressSet {
        AddressSet::new(self.instances.iter().map(ServiceInstance::endpoint).collect())
    }
}

/// Agent service registration body (`PUT /v1/agent/service/register`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,

    #[serde(rename = "Address", default)]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,

    #[serde(rename = "Check", default, skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

/// Health-check definition attached to a registration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentServiceCheck {
    #[serde(rename = "GRPC", default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<String>,

    #[serde(rename = "HTTP", default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    #[serde(rename = "TCP", default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,

    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(
        rename = "DeregisterCriticalServiceAfter",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deregister_critical_service_after: Option<String>,
}

/// Entry of `GET /v1/health/service/{name}`
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceHealth {
    #[serde(rename = "Node")]
    pub node: HealthNode,

    #[serde(rename = "Service")]
    pub service: HealthService,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthNode {
    #[serde(rename = "Node", default)]
    pub node: String,

    #[serde(rename = "Address", default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthService {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Service", default)]
    pub service: String,

    #[serde(rename = "Tags", default)]
    pub tags: Option<Vec<String>>,

    #[serde(rename = "Address", default)]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,
}

impl From<ServiceHealth> for ServiceInstance {
    fn from(entry: ServiceHealth) -> Self {
        // An empty service address means "same as the node"
        let address = if entry.service.address.is_empty() {
            entry.node.address
        } else {
            entry.service.address
        };
        ServiceInstance {
            id: entry.service.id,
            service: entry.service.service,
            address,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default(),
        }
    }
}
