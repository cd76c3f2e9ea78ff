//! Tessera Discovery
//!
//! Client adapter over the discovery backend, instance registration, and
//! push-based name resolution for RPC client load balancing.

pub mod client;
pub mod error;
pub mod model;
pub mod registrar;
pub mod resolver;
pub mod target;

pub use client::{ConsulClient, ConsulClientConfig, DiscoveryClient};
pub use error::{DiscoveryError, Result};
pub use model::{
    Address, AddressSet, HealthQuery, HealthyInstances, ServiceDescriptor, ServiceInstance,
    WatchCursor,
};
pub use registrar::Registrar;
pub use resolver::{
    AddressListener, BalancedChannelListener, ClientFactory, ConsulResolver,
    ConsulResolverBuilder, FnAddressListener, Resolver, ResolverBuilder, ResolverRegistry,
    WatchConfig,
};
pub use target::Target;
