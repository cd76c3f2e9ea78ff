//! Discovery client adapter
//!
//! `DiscoveryClient` is the call surface the registrar and resolvers use;
//! `ConsulClient` implements it over the Consul agent HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use tessera_common::format_duration;
use tracing::debug;

use crate::error::{DiscoveryError, Result};
use crate::model::{HealthQuery, HealthyInstances, ServiceDescriptor, ServiceHealth, WatchCursor};

/// Response header carrying the blocking-query index
pub const INDEX_HEADER: &str = "X-Consul-Index";
/// Request header carrying the ACL token
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Operations against the discovery backend
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Register (or overwrite) an instance
    async fn register(&self, descriptor: &ServiceDescriptor) -> Result<()>;

    /// Remove an instance by registration id
    async fn deregister(&self, id: &str) -> Result<()>;

    /// Query healthy instances, blocking until the state changes past
    /// `query.cursor` or the backend's long-poll timeout elapses
    async fn query_healthy(&self, query: &HealthQuery) -> Result<HealthyInstances>;
}

/// Configuration for the Consul HTTP client
#[derive(Clone, Debug)]
pub struct ConsulClientConfig {
    /// Agent address, `host:port` or a full `http(s)://` URL
    pub endpoint: String,
    /// Optional ACL token
    pub token: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Timeout for non-blocking calls, also added as slack to blocking ones
    pub request_timeout: Duration,
}

impl Default for ConsulClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8500".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsulClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        }
    }
}

/// Consul agent HTTP client
#[derive(Clone, Debug)]
pub struct ConsulClient {
    client: Client,
    base_url: String,
    config: ConsulClientConfig,
}

impl ConsulClient {
    pub fn new(config: ConsulClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            config,
        })
    }

    fn with_token(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// Request timeout for a blocking query: wait + wait/16 + slack
    ///
    /// The backend adds up to wait/16 of jitter to its own long-poll timer.
    fn blocking_timeout(&self, wait: Duration) -> Duration {
        wait + wait / 16 + self.config.request_timeout
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(DiscoveryError::Backend {
            status: status.as_u16(),
            message: message.trim().to_string(),
        })
    }
}

#[async_trait]
impl DiscoveryClient for ConsulClient {
    async fn register(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let body = descriptor.to_registration();

        debug!(id = %descriptor.id, service = %descriptor.name, "Registering service instance");

        let response = self
            .with_token(self.client.put(&url))
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);

        debug!(id = %id, "Deregistering service instance");

        let response = self
            .with_token(self.client.put(&url))
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn query_healthy(&self, query: &HealthQuery) -> Result<HealthyInstances> {
        let url = format!("{}/v1/health/service/{}", self.base_url, query.service);

        let mut params: Vec<(&str, String)> = vec![("passing", "true".to_string())];
        if let Some(tag) = &query.tag {
            params.push(("tag", tag.clone()));
        }

        // Without an index the backend answers immediately
        let timeout = if query.cursor.is_zero() {
            self.config.request_timeout
        } else {
            params.push(("index", query.cursor.to_string()));
            params.push(("wait", format_duration(query.wait)));
            self.blocking_timeout(query.wait)
        };

        let response = self
            .with_token(self.client.get(&url))
            .query(&params)
            .timeout(timeout)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let cursor = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(WatchCursor::new)
            .ok_or_else(|| {
                DiscoveryError::Decode(format!("missing or invalid {} header", INDEX_HEADER))
            })?;

        let entries: Vec<ServiceHealth> = response.json().await?;

        debug!(
            service = %query.service,
            cursor = %cursor,
            instances = entries.len(),
            "Health query returned"
        );

        Ok(HealthyInstances {
            instances: entries.into_iter().map(Into::into).collect(),
            cursor,
        })
    }
}
