//! Discovery-backed resolver and its watch loop

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::ReentrantMutex;
use tessera_common::{BackoffConfig, DISCOVERY_SCHEME};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AddressListener, Resolver, ResolverBuilder};
use crate::client::{ConsulClient, ConsulClientConfig, DiscoveryClient};
use crate::error::Result;
use crate::model::{Address, AddressSet, HealthQuery, WatchCursor};
use crate::target::Target;

/// Creates a discovery client for a target's backend address
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, backend: &Address) -> Result<Arc<dyn DiscoveryClient>>;
}

impl<F> ClientFactory for F
where
    F: Fn(&Address) -> Result<Arc<dyn DiscoveryClient>> + Send + Sync,
{
    fn client_for(&self, backend: &Address) -> Result<Arc<dyn DiscoveryClient>> {
        self(backend)
    }
}

/// Watch loop tuning
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Long-poll timeout requested from the backend
    pub wait: Duration,
    /// Delay policy after a failed query
    pub backoff: BackoffConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(300),
            backoff: BackoffConfig::new(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

/// Builder for `consul://` resolvers
pub struct ConsulResolverBuilder {
    factory: Arc<dyn ClientFactory>,
    default_tag: Option<String>,
    config: WatchConfig,
    parent: CancellationToken,
}

impl ConsulResolverBuilder {
    pub fn new(factory: impl ClientFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            default_tag: None,
            config: WatchConfig::default(),
            parent: CancellationToken::new(),
        }
    }

    /// Resolver builder creating one HTTP client per backend address
    ///
    /// Token and timeouts come from `base`; the endpoint comes from the target.
    pub fn with_client_config(base: ConsulClientConfig) -> Self {
        Self::new(move |backend: &Address| -> Result<Arc<dyn DiscoveryClient>> {
            let config = ConsulClientConfig {
                endpoint: backend.to_string(),
                ..base.clone()
            };
            Ok(Arc::new(ConsulClient::new(config)?))
        })
    }

    pub fn with_default_tag(mut self, tag: impl Into<String>) -> Self {
        self.default_tag = Some(tag.into()).filter(|t: &String| !t.is_empty());
        self
    }

    pub fn with_watch_config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancelling `token` stops every resolver built afterwards
    pub fn with_parent_token(mut self, token: CancellationToken) -> Self {
        self.parent = token;
        self
    }

    /// Parse the target and start its watch loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        &self,
        target: &str,
        listener: Arc<dyn AddressListener>,
    ) -> Result<ConsulResolver> {
        let target = Target::parse(target, self.default_tag.as_deref())?;
        let client = self.factory.client_for(&target.backend)?;

        let shared = Arc::new(Shared {
            token: self.parent.child_token(),
            wake: Notify::new(),
            listener: ReentrantMutex::new(RefCell::new(Some(listener))),
        });

        info!(resolver = %target, "Starting resolver");

        tokio::spawn(watch(
            shared.clone(),
            client,
            target.clone(),
            self.config.clone(),
        ));

        Ok(ConsulResolver { shared, target })
    }
}

impl ResolverBuilder for ConsulResolverBuilder {
    fn scheme(&self) -> &str {
        DISCOVERY_SCHEME
    }

    fn build(
        &self,
        target: &str,
        listener: Arc<dyn AddressListener>,
    ) -> Result<Box<dyn Resolver>> {
        Ok(Box::new(self.spawn(target, listener)?))
    }
}

struct Shared {
    token: CancellationToken,
    wake: Notify,
    /// Reentrant so a listener may close or drop its own resolver
    listener: ReentrantMutex<RefCell<Option<Arc<dyn AddressListener>>>>,
}

impl Shared {
    /// Deliver a set unless the resolver is closed; returns false once closed
    ///
    /// The listener is invoked under the slot lock so `close` from another
    /// thread cannot return while a push is in progress.
    fn push(&self, addresses: AddressSet) -> bool {
        let slot = self.listener.lock();
        let listener = slot.borrow().clone();
        match listener {
            Some(listener) if !self.token.is_cancelled() => {
                listener.update_state(addresses);
                true
            }
            _ => false,
        }
    }

    fn take_listener(&self) -> Option<Arc<dyn AddressListener>> {
        self.listener.lock().borrow_mut().take()
    }
}

/// Handle to a running `consul://` resolver; closes on drop
pub struct ConsulResolver {
    shared: Arc<Shared>,
    target: Target,
}

impl ConsulResolver {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

impl Resolver for ConsulResolver {
    fn resolve_now(&self) {
        // Only wakes a loop parked in backoff; an in-flight query is left alone
        self.shared.wake.notify_waiters();
    }

    fn close(&self) {
        self.shared.token.cancel();
        if self.shared.take_listener().is_some() {
            debug!(resolver = %self.target, "Resolver closed");
        }
    }
}

impl Drop for ConsulResolver {
    fn drop(&mut self) {
        self.close();
    }
}

async fn watch(
    shared: Arc<Shared>,
    client: Arc<dyn DiscoveryClient>,
    target: Target,
    config: WatchConfig,
) {
    let label = target.uri();
    let mut cursor = WatchCursor::ZERO;
    let mut last: Option<AddressSet> = None;
    let mut failures: u32 = 0;

    loop {
        let query = HealthQuery::new(target.service_name.clone())
            .with_tag(target.environment_tag.clone())
            .with_cursor(cursor)
            .with_wait(config.wait);

        let result = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            result = client.query_healthy(&query) => result,
        };

        match result {
            Ok(healthy) => {
                failures = 0;
                let moved = healthy.cursor != cursor;
                cursor = cursor.advance(healthy.cursor);
                if last.is_some() && !moved {
                    continue;
                }

                let addresses = healthy.address_set();
                if last.as_ref() == Some(&addresses) {
                    // Cursor moved (or was reset) without changing the set
                    debug!(resolver = %target, cursor = %cursor, "Address set unchanged");
                    continue;
                }

                let count = addresses.len();
                debug!(
                    resolver = %target,
                    cursor = %cursor,
                    addresses = %addresses,
                    "Pushing address set"
                );
                if !shared.push(addresses.clone()) {
                    break;
                }
                last = Some(addresses);
                counter!("tessera_resolver_updates_total", "target" => label.clone()).increment(1);
                gauge!("tessera_resolver_addresses", "target" => label.clone()).set(count as f64);
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let delay = config.backoff.delay_for_attempt(failures);
                counter!("tessera_resolver_errors_total", "target" => label.clone()).increment(1);
                warn!(
                    resolver = %target,
                    cursor = %cursor,
                    failures,
                    retry_in = ?delay,
                    error = %err,
                    "Health query failed"
                );

                tokio::select! {
                    biased;
                    _ = shared.token.cancelled() => break,
                    _ = shared.wake.notified() => {
                        debug!(resolver = %target, "Resolver woken early");
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!(resolver = %target, "Watch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;
    use crate::model::{HealthyInstances, ServiceDescriptor};
    use async_trait::async_trait;

    struct NoBackend;

    #[async_trait]
    impl DiscoveryClient for NoBackend {
        async fn register(&self, _descriptor: &ServiceDescriptor) -> Result<()> {
            Ok(())
        }

        async fn deregister(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn query_healthy(&self, _query: &HealthQuery) -> Result<HealthyInstances> {
            Err(DiscoveryError::BackendUnavailable("down".to_string()))
        }
    }

    fn builder() -> ConsulResolverBuilder {
        ConsulResolverBuilder::new(|_backend: &Address| -> Result<Arc<dyn DiscoveryClient>> {
            Ok(Arc::new(NoBackend))
        })
    }

    fn noop_listener() -> Arc<dyn AddressListener> {
        Arc::new(crate::resolver::FnAddressListener::new(|_| {}))
    }

    #[tokio::test]
    async fn test_invalid_target_fails_build() {
        let err = builder().build("localhost:abc/orders", noop_listener()).err();
        assert!(matches!(err, Some(DiscoveryError::InvalidTarget { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let resolver = builder()
            .with_default_tag("dev")
            .spawn("localhost/orders", noop_listener())
            .unwrap();
        assert_eq!(resolver.target().environment_tag.as_deref(), Some("dev"));

        resolver.close();
        resolver.close();
        assert!(resolver.is_closed());
    }

    #[tokio::test]
    async fn test_parent_token_closes_resolver() {
        let root = CancellationToken::new();
        let resolver = builder()
            .with_parent_token(root.clone())
            .spawn("localhost/orders", noop_listener())
            .unwrap();

        root.cancel();
        assert!(resolver.is_closed());
    }

    #[test]
    fn test_scheme() {
        assert_eq!(builder().scheme(), "consul");
    }
}
