//! Multiplexed server
//!
//! One listening socket carries both gRPC (HTTP/2) and HTTP/1 traffic. The
//! demux routes each connection to its server by the first bytes; HTTP/1
//! serves `/metrics` and the REST gateway, whose handlers call back into the
//! gRPC side over a loopback channel. The lifecycle is
//! [`Server::new`] → [`Server::bind`] → [`BoundServer::serve`], which returns
//! once the root token is cancelled and the ordered shutdown has run.

pub mod demux;
pub mod gateway;
pub mod grpc;
pub mod http;
pub mod listener;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tessera_common::DISCOVERY_SCHEME;
use tessera_discovery::{
    BalancedChannelListener, ConsulResolverBuilder, DiscoveryClient, Registrar, ResolverRegistry,
    WatchConfig,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::exit::ExitHooks;
use crate::health::HealthReporter;
use crate::model::AppConfig;
use crate::startup::{ShutdownReport, ShutdownSequence};

pub use gateway::{GatewayError, GatewayResult, grpc_request};
use self::grpc::GrpcLogLayer;

/// Pending connections per protocol between the demux and a server
const ACCEPT_QUEUE: usize = 128;

/// Endpoint slots of a client balance channel
const BALANCE_CAPACITY: usize = 1024;

const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A service hosted by the server
///
/// Implementations add their gRPC service to the routes and may expose
/// REST routes through the gateway.
pub trait ServiceRegistrar: Send + Sync {
    fn name(&self) -> &str;

    fn register_grpc(&self, routes: &mut RoutesBuilder);

    /// Add REST routes to `router`
    ///
    /// `channel` is a lazily connected loopback channel to this server's
    /// gRPC side, called once the socket is bound.
    fn register_gateway(&self, router: Router, _channel: Channel) -> Result<Router> {
        Ok(router)
    }
}

pub struct Server {
    config: AppConfig,
    discovery: Arc<dyn DiscoveryClient>,
    root: CancellationToken,
    routes: RoutesBuilder,
    services: Vec<Box<dyn ServiceRegistrar>>,
    health: Arc<HealthReporter>,
    metrics: Option<PrometheusHandle>,
    exit_hooks: Arc<ExitHooks>,
    resolvers: ResolverRegistry,
}

impl Server {
    /// Create a server hosting the gRPC health service
    ///
    /// Cancelling `root` starts the shutdown sequence and stops every
    /// resolver created through [`Server::connect`].
    pub fn new(
        config: AppConfig,
        discovery: Arc<dyn DiscoveryClient>,
        root: CancellationToken,
    ) -> Self {
        let health = Arc::new(HealthReporter::new(vec![config.server.name.clone()]));
        let mut routes = RoutesBuilder::default();
        routes.add_service(health.service());

        let resolver = ConsulResolverBuilder::with_client_config(config.consul.client_config())
            .with_default_tag(config.server.environment.clone())
            .with_watch_config(WatchConfig {
                wait: config.consul.watch_wait,
                ..WatchConfig::default()
            })
            .with_parent_token(root.clone());
        let resolvers = ResolverRegistry::new().with(Arc::new(resolver));

        Self {
            config,
            discovery,
            root,
            routes,
            services: Vec::new(),
            health,
            metrics: None,
            exit_hooks: Arc::new(ExitHooks::new()),
            resolvers,
        }
    }

    /// Serve `/metrics` from this recorder handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn with_exit_hooks(mut self, hooks: Arc<ExitHooks>) -> Self {
        self.exit_hooks = hooks;
        self
    }

    /// Host a service on the gRPC router; its gateway routes are added at bind
    pub fn add_service(mut self, service: impl ServiceRegistrar + 'static) -> Self {
        service.register_grpc(&mut self.routes);
        info!(service = service.name(), "Added service");
        self.services.push(Box::new(service));
        self
    }

    pub fn health(&self) -> Arc<HealthReporter> {
        self.health.clone()
    }

    /// Open a round-robin balanced channel to every healthy instance of `service`
    ///
    /// The resolver follows the discovery backend until the root token is
    /// cancelled or the exit hooks run. Must be called within a Tokio runtime.
    pub fn connect(&self, service: &str) -> Result<Channel> {
        let backend = self
            .config
            .consul
            .endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        let uri = format!("{}://{}/{}", DISCOVERY_SCHEME, backend, service);

        let (channel, listener) =
            BalancedChannelListener::channel(BALANCE_CAPACITY, CLIENT_CONNECT_TIMEOUT);
        let resolver = self.resolvers.resolve(&uri, Arc::new(listener))?;

        self.exit_hooks.add(format!("resolver {}", uri), move |_| {
            resolver.close();
            Ok(())
        });
        info!(target_uri = %uri, "Connected client channel");
        Ok(channel)
    }

    /// Bind the listening socket and build the gateway routes
    pub async fn bind(self) -> Result<BoundServer> {
        let addr = self.config.server.socket_addr()?;
        let listener = listener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let channel = gateway::loopback_channel(local_addr)?;
        let mut routes = Router::new();
        for service in &self.services {
            routes = service.register_gateway(routes, channel.clone())?;
        }

        info!(endpoint = %local_addr, "Server listening");
        Ok(BoundServer {
            server: self,
            listener,
            local_addr,
            gateway: routes,
        })
    }
}

/// A server whose socket is bound but not yet serving
pub struct BoundServer {
    server: Server,
    listener: TcpListener,
    local_addr: SocketAddr,
    gateway: Router,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn health(&self) -> Arc<HealthReporter> {
        self.server.health.clone()
    }

    /// Serve until the root token is cancelled, then shut down in order
    ///
    /// The instance is registered once serving starts. A registration that
    /// does not succeed within the retry window shuts the server down and
    /// is returned as the error.
    pub async fn serve(self) -> Result<ShutdownReport> {
        let BoundServer {
            server,
            listener,
            local_addr,
            gateway,
        } = self;
        let Server {
            config,
            discovery,
            root,
            routes,
            health,
            metrics,
            ..
        } = server;

        let demux_stop = CancellationToken::new();
        let grpc_stop = CancellationToken::new();
        let http_stop = CancellationToken::new();

        let (grpc_tx, grpc_rx) = mpsc::channel(ACCEPT_QUEUE);
        let (http_tx, http_rx) = mpsc::channel(ACCEPT_QUEUE);

        let demux_task = tokio::spawn(demux::run(
            listener,
            config.server.max_connections,
            demux::Queues {
                grpc: grpc_tx,
                http: http_tx,
            },
            demux_stop.clone(),
            demux::SNIFF_TIMEOUT,
        ));
        let grpc_task = grpc::spawn(
            routes,
            GrpcLogLayer::new(config.server.log_payloads),
            grpc_rx,
            grpc_stop.clone(),
        );
        let http_task = self::http::spawn(
            http_rx,
            self::http::router(metrics, gateway),
            http_stop.clone(),
        );
        let aborts = [
            demux_task.abort_handle(),
            grpc_task.abort_handle(),
            http_task.abort_handle(),
        ];

        let registrar = Arc::new(
            Registrar::new(discovery, config.descriptor(local_addr.port()))
                .with_retry_window(config.consul.registration_retry_window),
        );
        let registration = tokio::select! {
            biased;
            _ = root.cancelled() => Ok(false),
            result = registrar.register() => result.map(|_| true),
        };

        let (registered, failure) = match registration {
            Ok(true) => {
                info!(
                    id = %registrar.descriptor().id,
                    endpoint = %local_addr,
                    "Server started"
                );
                root.cancelled().await;
                (true, None)
            }
            Ok(false) => (false, None),
            Err(e) => {
                error!(error = %e, "Registration failed, shutting down");
                root.cancel();
                (false, Some(e))
            }
        };

        info!("Shutting down server");
        let mut sequence = ShutdownSequence::new(config.server.shutdown_timeout).step("health", {
            let health = health.clone();
            async move {
                health.shutdown();
                Ok(())
            }
        });
        if registered && config.server.deregister_on_shutdown {
            let registrar = registrar.clone();
            sequence = sequence.step("deregister", async move {
                registrar.deregister().await?;
                Ok(())
            });
        }
        let report = sequence
            .step("grpc", async move {
                grpc_stop.cancel();
                grpc_task.await??;
                Ok(())
            })
            .step("http", async move {
                http_stop.cancel();
                http_task.await?;
                Ok(())
            })
            .step("demux", async move {
                demux_stop.cancel();
                demux_task.await?;
                Ok(())
            })
            .run()
            .await;

        // Tasks that outlived their step deadline
        for handle in aborts {
            if !handle.is_finished() {
                warn!("Aborting server task after shutdown deadline");
                handle.abort();
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => {
                info!(clean = report.is_clean(), "Server stopped");
                Ok(report)
            }
        }
    }
}
