//! Name resolution
//!
//! A resolver turns the backend's pull-based blocking query into a stream
//! of full address-set refreshes pushed to an [`AddressListener`].

mod balance;
mod registry;
mod watch;

pub use balance::BalancedChannelListener;
pub use registry::ResolverRegistry;
pub use watch::{ClientFactory, ConsulResolver, ConsulResolverBuilder, WatchConfig};

use std::sync::Arc;

use crate::error::Result;
use crate::model::AddressSet;

/// Receiver of address-set refreshes
///
/// Every call replaces the previous set; nothing is merged. `update_state`
/// may close or drop the resolver that is calling it; the push in progress
/// completes and no further push follows.
pub trait AddressListener: Send + Sync + 'static {
    fn update_state(&self, addresses: AddressSet);
}

/// A listener that invokes a closure.
pub struct FnAddressListener<F>
where
    F: Fn(AddressSet) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnAddressListener<F>
where
    F: Fn(AddressSet) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> AddressListener for FnAddressListener<F>
where
    F: Fn(AddressSet) + Send + Sync + 'static,
{
    fn update_state(&self, addresses: AddressSet) {
        (self.f)(addresses);
    }
}

/// Handle to a running resolver
pub trait Resolver: Send + Sync {
    /// Hint to re-resolve; wakes a resolver that is backing off
    fn resolve_now(&self);

    /// Stop the watch loop; idempotent. No push happens after this returns.
    fn close(&self);
}

/// Scheme-identified resolver factory
pub trait ResolverBuilder: Send + Sync {
    fn scheme(&self) -> &str;

    fn build(
        &self,
        target: &str,
        listener: Arc<dyn AddressListener>,
    ) -> Result<Box<dyn Resolver>>;
}
