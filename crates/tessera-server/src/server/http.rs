//! HTTP/1 side of the multiplexed server
//!
//! Serves `/metrics` from the Prometheus recorder next to the REST gateway
//! routes. Unmatched paths and methods get gRPC-gateway error bodies.

use axum::Router;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::{StatusCode, header};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::demux::describe_peer;
use super::gateway;
use super::listener::LimitedStream;
use crate::metrics::{Timer, record_http_request};
use crate::startup::logging::ACCESS_TARGET;

pub const METRICS_PATH: &str = "/metrics";

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Route label of requests no route matched
const UNMATCHED_ROUTE: &str = "unmatched";

/// Router of the HTTP/1 side: `/metrics` plus the gateway routes
///
/// Panics if the gateway also routes `/metrics`.
pub fn router(metrics: Option<PrometheusHandle>, routes: Router) -> Router {
    Router::new()
        .route(METRICS_PATH, get(move || render_metrics(metrics.clone())))
        .merge(routes)
        .fallback(gateway::not_found)
        .method_not_allowed_fallback(gateway::method_not_allowed)
        .layer(middleware::from_fn(record_access))
}

async fn render_metrics(metrics: Option<PrometheusHandle>) -> Response {
    let content_type = [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)];
    match metrics {
        Some(handle) => (content_type, handle.render()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            content_type,
            "metrics recorder not installed\n",
        )
            .into_response(),
    }
}

/// Access log and request metrics, labelled by the matched route pattern
async fn record_access(request: Request, next: Next) -> Response {
    let timer = Timer::new();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED_ROUTE, MatchedPath::as_str)
        .to_string();

    let response = next.run(request).await;

    let elapsed = timer.elapsed();
    let status = response.status().as_u16();
    record_http_request(method.as_str(), &route, status, elapsed.as_secs_f64());
    debug!(
        target: ACCESS_TARGET,
        method = %method,
        path = %path,
        route = %route,
        status,
        elapsed = ?elapsed,
        "HTTP request"
    );
    response
}

/// Spawn the HTTP/1 serve loop over connections routed by the demux
///
/// Stops accepting once `stop` is cancelled, then waits for open
/// connections to finish their current request.
pub fn spawn(
    mut incoming: mpsc::Receiver<LimitedStream>,
    router: Router,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let graceful = GracefulShutdown::new();

        loop {
            let stream = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                stream = incoming.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };

            let peer = describe_peer(&stream);
            let service = TowerToHyperService::new(router.clone());
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            let conn = graceful.watch(conn);
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(remote = %peer, error = %e, "HTTP connection error");
                }
            });
        }

        // Stop the demux from routing more connections here
        incoming.close();
        graceful.shutdown().await;
        info!("HTTP server stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::body::Body;
    use http::Method;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn request(method: Method, uri: &str) -> http::Request<Body> {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn gateway() -> Router {
        Router::new().route("/v1/ping", get(|| async { Json(json!({"pong": true})) }))
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let response = router(None, Router::new())
            .oneshot(request(Method::GET, METRICS_PATH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROMETHEUS_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_gateway_routes_and_fallbacks() {
        let app = router(None, gateway());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/v1/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"pong": true}));

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/v1/none"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], 5);

        let response = app
            .oneshot(request(Method::DELETE, "/v1/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_json(response).await["code"], 12);
    }
}
