//! Explicit resolver registry keyed by URI scheme

use std::collections::HashMap;
use std::sync::Arc;

use super::{AddressListener, Resolver, ResolverBuilder};
use crate::error::{DiscoveryError, Result};

/// Maps schemes to resolver builders
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    builders: HashMap<String, Arc<dyn ResolverBuilder>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder, replacing any previous one for the same scheme
    pub fn register(&mut self, builder: Arc<dyn ResolverBuilder>) {
        self.builders.insert(builder.scheme().to_string(), builder);
    }

    pub fn with(mut self, builder: Arc<dyn ResolverBuilder>) -> Self {
        self.register(builder);
        self
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).cloned()
    }

    /// Build a resolver for `scheme://target`
    pub fn resolve(
        &self,
        uri: &str,
        listener: Arc<dyn AddressListener>,
    ) -> Result<Box<dyn Resolver>> {
        let (scheme, _) = uri
            .split_once("://")
            .ok_or_else(|| DiscoveryError::invalid_target(uri, "missing scheme"))?;
        let builder = self
            .get(scheme)
            .ok_or_else(|| DiscoveryError::UnknownScheme(scheme.to_string()))?;
        builder.build(uri, listener)
    }
}
