//! Consul adapter tests against a mock agent

use std::time::Duration;

use serde_json::json;
use tessera_discovery::{
    Address, ConsulClient, ConsulClientConfig, DiscoveryClient, DiscoveryError, HealthQuery,
    ServiceDescriptor, WatchCursor,
};
use wiremock::matchers::{body_json, header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> ConsulClient {
    ConsulClient::new(ConsulClientConfig::new(server.uri()).with_token(Some("secret".into())))
        .unwrap()
}

#[tokio::test]
async fn test_register_sends_agent_registration() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(header("X-Consul-Token", "secret"))
        .and(body_json(json!({
            "ID": "orders-10.0.0.5-7000",
            "Name": "orders",
            "Tags": ["dev"],
            "Address": "10.0.0.5",
            "Port": 7000,
            "Check": {
                "GRPC": "10.0.0.5:7000/orders",
                "Interval": "10s",
                "DeregisterCriticalServiceAfter": "60s"
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = ServiceDescriptor::new("orders", "10.0.0.5", 7000).with_tag("dev");
    client(&server).register(&descriptor).await.unwrap();
}

#[tokio::test]
async fn test_deregister() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/orders-10.0.0.5-7000"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .deregister("orders-10.0.0.5-7000")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_query_healthy_initial_is_non_blocking() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("passing", "true"))
        .and(query_param("tag", "prod"))
        .and(query_param_is_missing("index"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "42")
                .set_body_json(json!([
                    {
                        "Node": {"Node": "node-1", "Address": "10.0.0.1"},
                        "Service": {
                            "ID": "orders-10.0.0.5-7000", "Service": "orders", "Tags": ["prod"],
                            "Address": "10.0.0.5", "Port": 7000
                        },
                        "Checks": []
                    },
                    {
                        "Node": {"Node": "node-2", "Address": "10.0.0.2"},
                        "Service": {
                            "ID": "orders-b", "Service": "orders", "Tags": ["prod"],
                            "Address": "", "Port": 7001
                        },
                        "Checks": []
                    }
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let query = HealthQuery::new("orders").with_tag(Some("prod".into()));
    let healthy = client(&server).query_healthy(&query).await.unwrap();

    assert_eq!(healthy.cursor, WatchCursor::new(42));
    assert_eq!(
        healthy.address_set().into_inner(),
        vec![Address::new("10.0.0.5", 7000), Address::new("10.0.0.2", 7001)]
    );
}

#[tokio::test]
async fn test_query_healthy_blocking_passes_index_and_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("index", "42"))
        .and(query_param("wait", "30s"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "43")
                .set_body_json(json!([])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let query = HealthQuery::new("orders")
        .with_cursor(WatchCursor::new(42))
        .with_wait(Duration::from_secs(30));
    let healthy = client(&server).query_healthy(&query).await.unwrap();

    assert_eq!(healthy.cursor, WatchCursor::new(43));
    assert!(healthy.instances.is_empty());
}

#[tokio::test]
async fn test_backend_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
        .mount(&server)
        .await;

    let err = client(&server)
        .query_healthy(&HealthQuery::new("orders"))
        .await
        .unwrap_err();

    match err {
        DiscoveryError::Backend { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "No cluster leader");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_index_header_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let err = client(&server)
        .query_healthy(&HealthQuery::new("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Decode(_)));
}

#[tokio::test]
async fn test_unreachable_backend_is_unavailable() {
    // Reserve a port and release it so nothing listens there
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = ConsulClient::new(
        ConsulClientConfig::new(format!("127.0.0.1:{}", port))
            .with_request_timeout(Duration::from_secs(2)),
    )
    .unwrap();

    let err = client
        .query_healthy(&HealthQuery::new("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::BackendUnavailable(_)));
    assert!(err.is_transient());
}
