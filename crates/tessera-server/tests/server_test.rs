//! End-to-end tests of the multiplexed server on a loopback socket

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tessera_discovery::{
    DiscoveryClient, DiscoveryError, HealthQuery, HealthyInstances, Result as DiscoveryResult,
    ServiceDescriptor, WatchCursor,
};
use tessera_server::{
    AppConfig, ExitHooks, GatewayResult, HealthState, Server, ServerError, ServiceRegistrar,
    grpc_request,
};
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;

#[derive(Default)]
struct RecordingDiscovery {
    reject: bool,
    registered: Mutex<Vec<ServiceDescriptor>>,
    deregistered: Mutex<Vec<String>>,
}

#[async_trait]
impl DiscoveryClient for RecordingDiscovery {
    async fn register(&self, descriptor: &ServiceDescriptor) -> DiscoveryResult<()> {
        if self.reject {
            return Err(DiscoveryError::Backend {
                status: 400,
                message: "Invalid service address".to_string(),
            });
        }
        self.registered.lock().push(descriptor.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> DiscoveryResult<()> {
        self.deregistered.lock().push(id.to_string());
        Ok(())
    }

    async fn query_healthy(&self, _query: &HealthQuery) -> DiscoveryResult<HealthyInstances> {
        Ok(HealthyInstances {
            instances: Vec::new(),
            cursor: WatchCursor::new(1),
        })
    }
}

struct EchoService;

impl ServiceRegistrar for EchoService {
    fn name(&self) -> &str {
        "echo"
    }

    fn register_grpc(&self, _routes: &mut RoutesBuilder) {}

    fn register_gateway(
        &self,
        router: Router,
        channel: Channel,
    ) -> tessera_server::Result<Router> {
        Ok(router
            .route(
                "/v1/echo/{word}",
                get(|Path(word): Path<String>| async move { Json(json!({ "word": word })) }),
            )
            .route(
                "/v1/health/{service}",
                get(move |Path(service): Path<String>, headers: HeaderMap| {
                    check_over_grpc(channel.clone(), service, headers)
                }),
            ))
    }
}

/// REST face of `grpc.health.v1.Health/Check`, called through the loopback channel
async fn check_over_grpc(
    channel: Channel,
    service: String,
    headers: HeaderMap,
) -> GatewayResult<Value> {
    let response = HealthClient::new(channel)
        .check(grpc_request(&headers, HealthCheckRequest { service }))
        .await?
        .into_inner();
    Ok(Json(json!({ "status": response.status })))
}

fn test_config(deregister_on_shutdown: bool) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.name = "orders".to_string();
    config.server.endpoint = "127.0.0.1:0".to_string();
    config.server.advertise_address = Some("127.0.0.1".to_string());
    config.server.shutdown_timeout = Duration::from_secs(5);
    config.server.deregister_on_shutdown = deregister_on_shutdown;
    config.consul.registration_retry_window = Duration::from_secs(1);
    config
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn wait_until_registered(discovery: &RecordingDiscovery) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while discovery.registered.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("instance was not registered");
}

#[tokio::test]
async fn test_serves_grpc_and_http_on_one_port_then_shuts_down_in_order() {
    let metrics = tessera_server::metrics::init_metrics().unwrap();
    let discovery = Arc::new(RecordingDiscovery::default());
    let root = CancellationToken::new();

    let server = Server::new(test_config(false), discovery.clone(), root.clone())
        .with_metrics(metrics)
        .with_exit_hooks(Arc::new(ExitHooks::with_terminator(|_| {})))
        .add_service(EchoService);
    let health = server.health();

    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr();
    assert_ne!(addr.port(), 0);
    let serving = tokio::spawn(bound.serve());

    wait_until_registered(&discovery).await;
    {
        let registered = discovery.registered.lock();
        assert_eq!(registered[0].port, addr.port());
        assert_eq!(registered[0].id, format!("orders-127.0.0.1-{}", addr.port()));
        assert!(registered[0].tags.contains("dev"));
    }

    // gRPC health over the shared port
    let channel = tonic::transport::Endpoint::from_shared(format!("http://{}", addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = HealthClient::new(channel);
    for service in ["", "orders"] {
        let response = client
            .check(HealthCheckRequest {
                service: service.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, ServingStatus::Serving as i32);
    }
    drop(client);

    // HTTP/1 gateway and metrics over the same port
    let http = http_client();
    let echo: serde_json::Value = http
        .get(format!("http://{}/v1/echo/hello", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(echo["word"], "hello");

    let missing = http
        .get(format!("http://{}/v1/unknown", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    // REST through the loopback channel to a real gRPC method
    let checked: Value = http
        .get(format!("http://{}/v1/health/orders", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(checked["status"], ServingStatus::Serving as i32);

    let unknown = http
        .get(format!("http://{}/v1/health/billing", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = unknown.json().await.unwrap();
    assert_eq!(body["code"], 5);
    assert_eq!(body["message"], "unknown service 'billing'");

    let metrics = http
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), reqwest::StatusCode::OK);
    let body = metrics.text().await.unwrap();
    assert!(body.contains("grpc_requests_total"));
    assert!(body.contains("http_requests_total"));
    drop(http);

    root.cancel();
    let report = tokio::time::timeout(Duration::from_secs(30), serving)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(report.step_names(), vec!["health", "grpc", "http", "demux"]);
    assert!(report.is_clean());
    assert_eq!(health.check(), HealthState::NotServing);
    assert!(discovery.deregistered.lock().is_empty());
}

#[tokio::test]
async fn test_open_health_watch_does_not_hold_shutdown() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let root = CancellationToken::new();

    let bound = Server::new(test_config(false), discovery.clone(), root.clone())
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr();
    let serving = tokio::spawn(bound.serve());
    wait_until_registered(&discovery).await;

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{}", addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut stream = HealthClient::new(channel)
        .watch(HealthCheckRequest {
            service: "orders".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.status, ServingStatus::Serving as i32);

    root.cancel();
    let last = stream.message().await.unwrap().unwrap();
    assert_eq!(last.status, ServingStatus::NotServing as i32);
    assert!(stream.message().await.unwrap().is_none());

    let report = tokio::time::timeout(Duration::from_secs(10), serving)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.step_names(), vec!["health", "grpc", "http", "demux"]);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_deregisters_on_shutdown_when_configured() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let root = CancellationToken::new();

    let bound = Server::new(test_config(true), discovery.clone(), root.clone())
        .bind()
        .await
        .unwrap();
    let port = bound.local_addr().port();
    let serving = tokio::spawn(bound.serve());

    wait_until_registered(&discovery).await;
    root.cancel();

    let report = serving.await.unwrap().unwrap();
    assert_eq!(
        report.step_names(),
        vec!["health", "deregister", "grpc", "http", "demux"]
    );
    assert_eq!(
        discovery.deregistered.lock().as_slice(),
        [format!("orders-127.0.0.1-{}", port)]
    );
}

#[tokio::test]
async fn test_registration_failure_stops_server() {
    let discovery = Arc::new(RecordingDiscovery {
        reject: true,
        ..Default::default()
    });
    let root = CancellationToken::new();

    let server = Server::new(test_config(false), discovery, root.clone());
    let health = server.health();
    let result = server.bind().await.unwrap().serve().await;

    assert!(matches!(result, Err(ServerError::Discovery(_))));
    assert!(root.is_cancelled());
    assert_eq!(health.check(), HealthState::NotServing);
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config(false);
    config.server.endpoint = taken.local_addr().unwrap().to_string();

    let server = Server::new(
        config,
        Arc::new(RecordingDiscovery::default()),
        CancellationToken::new(),
    );
    let result = server.bind().await;
    assert!(matches!(
        result,
        Err(ServerError::ListenerBindFailed { .. })
    ));
}
