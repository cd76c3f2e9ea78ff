//! Registrar
//!
//! Registers the local instance with the discovery backend once at startup,
//! retrying transient failures with backoff inside a bounded window.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tessera_common::BackoffConfig;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::DiscoveryClient;
use crate::error::{DiscoveryError, Result};
use crate::model::ServiceDescriptor;

/// Default time budget for the registration retry loop
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(30);

pub struct Registrar {
    client: Arc<dyn DiscoveryClient>,
    descriptor: ServiceDescriptor,
    retry_window: Duration,
    backoff: BackoffConfig,
}

impl Registrar {
    pub fn new(client: Arc<dyn DiscoveryClient>, descriptor: ServiceDescriptor) -> Self {
        Self {
            client,
            descriptor,
            retry_window: DEFAULT_RETRY_WINDOW,
            backoff: BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(5)),
        }
    }

    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Register the instance
    ///
    /// Idempotent: the id is deterministic so the backend overwrites an
    /// existing registration. Non-transient errors fail immediately.
    pub async fn register(&self) -> Result<()> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match self.client.register(&self.descriptor).await {
                Ok(()) => {
                    counter!("tessera_registrations_total", "result" => "ok").increment(1);
                    info!(
                        id = %self.descriptor.id,
                        service = %self.descriptor.name,
                        address = %self.descriptor.address,
                        port = self.descriptor.port,
                        attempts = attempt,
                        "Service instance registered"
                    );
                    return Ok(());
                }
                Err(err) => err,
            };

            let elapsed = started.elapsed();
            let delay = self.backoff.delay_for_attempt(attempt);
            if !err.is_transient() || elapsed + delay > self.retry_window {
                counter!("tessera_registrations_total", "result" => "failed").increment(1);
                return Err(DiscoveryError::RegistrationFailed {
                    id: self.descriptor.id.clone(),
                    attempts: attempt,
                    elapsed,
                    source: Box::new(err),
                });
            }

            warn!(
                id = %self.descriptor.id,
                attempt,
                retry_in = ?delay,
                error = %err,
                "Registration failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Remove the registration from the backend
    pub async fn deregister(&self) -> Result<()> {
        self.client.deregister(&self.descriptor.id).await?;
        info!(id = %self.descriptor.id, "Service instance deregistered");
        Ok(())
    }
}
