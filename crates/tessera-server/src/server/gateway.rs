//! REST gateway
//!
//! Hosted services expose REST routes as an [`axum::Router`]. Handlers reach
//! their gRPC implementation through a lazily connected loopback [`Channel`]
//! to the server's own socket, so a REST call goes through the same gRPC
//! stack as a direct one. Errors use the gRPC-gateway JSON body
//! `{"code", "message", "details"}` and status mapping.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, Method, StatusCode, Uri, header};
use serde_json::json;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use crate::error::Result;

/// Header prefix forwarded as gRPC metadata with the prefix stripped
const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";

/// Result of a gateway handler
pub type GatewayResult<T> = std::result::Result<Json<T>, GatewayError>;

/// A gRPC status rendered as a gRPC-gateway error response
#[derive(Debug)]
pub struct GatewayError(pub Status);

impl From<Status> for GatewayError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Status::invalid_argument(format!(
            "invalid JSON body: {}",
            rejection.body_text()
        )))
    }
}

impl From<PathRejection> for GatewayError {
    fn from(rejection: PathRejection) -> Self {
        Self(Status::invalid_argument(format!(
            "invalid path parameter: {}",
            rejection.body_text()
        )))
    }
}

impl From<QueryRejection> for GatewayError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Status::invalid_argument(format!(
            "invalid query string: {}",
            rejection.body_text()
        )))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        error_response(&self.0)
    }
}

/// HTTP status for a gRPC code, as the gRPC-gateway maps them
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error response in the gRPC-gateway shape
pub fn error_response(status: &Status) -> Response {
    let body = json!({
        "code": status.code() as i32,
        "message": status.message(),
        "details": [],
    });
    (http_status(status.code()), Json(body)).into_response()
}

/// Forward `authorization` and `grpc-metadata-*` headers as metadata
pub fn forwarded_metadata(headers: &HeaderMap) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (name, value) in headers {
        let key = if name == header::AUTHORIZATION {
            name.as_str()
        } else if let Some(stripped) = name.as_str().strip_prefix(METADATA_HEADER_PREFIX) {
            stripped
        } else {
            continue;
        };
        let Ok(key) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
            continue;
        };
        if let Ok(value) = AsciiMetadataValue::try_from(value.as_bytes()) {
            metadata.insert(key, value);
        }
    }
    metadata
}

/// gRPC request carrying the metadata forwarded from `headers`
pub fn grpc_request<T>(headers: &HeaderMap, message: T) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = forwarded_metadata(headers);
    request
}

/// Fallback for paths no route matches
pub async fn not_found(method: Method, uri: Uri) -> GatewayError {
    GatewayError(Status::not_found(format!(
        "no route for {} {}",
        method,
        uri.path()
    )))
}

/// Fallback for a known path called with the wrong method
pub async fn method_not_allowed(method: Method, uri: Uri) -> Response {
    let status = Status::unimplemented(format!(
        "method {} not allowed for {}",
        method,
        uri.path()
    ));
    let mut response = error_response(&status);
    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    response
}

/// Client address for a socket bound on `local_addr`
///
/// A wildcard bind is reached through the loopback address of its family.
fn loopback_uri(local_addr: SocketAddr) -> String {
    let ip = match local_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    format!("http://{}", SocketAddr::new(ip, local_addr.port()))
}

/// Lazily connected channel to the gRPC side of this server
///
/// Must be called within a Tokio runtime.
pub fn loopback_channel(local_addr: SocketAddr) -> Result<Channel> {
    Ok(Endpoint::from_shared(loopback_uri(local_addr))?.connect_lazy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::extract::{Path, Query};
    use axum::routing::{get, post};
    use http::Request;
    use http_body_util::BodyExt;
    use serde::Deserialize;
    use serde_json::Value;
    use tower::ServiceExt;

    #[derive(Deserialize)]
    struct OrderQuery {
        verbose: Option<bool>,
    }

    #[derive(Deserialize)]
    struct NewOrder {
        item: String,
    }

    async fn get_order(
        Path(id): Path<String>,
        query: std::result::Result<Query<OrderQuery>, QueryRejection>,
        headers: HeaderMap,
    ) -> GatewayResult<Value> {
        let Query(query) = query?;
        if id == "missing" {
            return Err(Status::not_found("order not found").into());
        }
        let request = grpc_request(&headers, id);
        let metadata = request.metadata();
        Ok(Json(json!({
            "id": request.get_ref(),
            "verbose": query.verbose,
            "tenant": metadata.get("tenant").and_then(|v| v.to_str().ok()),
            "auth": metadata.get("authorization").is_some(),
            "ignored": metadata.get("x-ignored").is_some(),
        })))
    }

    async fn create_order(
        body: std::result::Result<Json<NewOrder>, JsonRejection>,
    ) -> GatewayResult<Value> {
        let Json(order) = body?;
        Ok(Json(json!({ "created": order.item })))
    }

    fn router() -> Router {
        Router::new()
            .route("/v1/orders/{id}", get(get_order))
            .route("/v1/orders", post(create_order))
    }

    fn request(method: Method, uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("authorization", "Bearer t0ken")
            .header("grpc-metadata-tenant", "acme")
            .header("x-ignored", "1")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_path_query_and_metadata() {
        let response = router()
            .oneshot(request(Method::GET, "/v1/orders/42?verbose=true", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], "42");
        assert_eq!(body["verbose"], true);
        assert_eq!(body["tenant"], "acme");
        assert_eq!(body["auth"], true);
        assert_eq!(body["ignored"], false);
    }

    #[tokio::test]
    async fn test_json_body() {
        let response = router()
            .oneshot(request(Method::POST, "/v1/orders", r#"{"item": "book"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["created"], "book");
    }

    #[tokio::test]
    async fn test_handler_status_maps_to_http() {
        let response = router()
            .oneshot(request(Method::GET, "/v1/orders/missing", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = body_json(response).await;
        assert_eq!(body["code"], 5);
        assert_eq!(body["message"], "order not found");
        assert_eq!(body["details"], json!([]));
    }

    #[tokio::test]
    async fn test_rejections_use_gateway_body() {
        let response = router()
            .oneshot(request(Method::POST, "/v1/orders", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], 3);

        let response = router()
            .oneshot(request(Method::GET, "/v1/orders/1?verbose=maybe", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], 3);
    }

    #[tokio::test]
    async fn test_fallbacks() {
        let response = not_found(Method::GET, Uri::from_static("/v2/unknown"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["message"], "no route for GET /v2/unknown");

        let response = method_not_allowed(Method::DELETE, Uri::from_static("/v1/orders")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_json(response).await["code"], 12);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(Code::Ok), StatusCode::OK);
        assert_eq!(http_status(Code::Cancelled).as_u16(), 499);
        assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(Code::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_loopback_uri() {
        let uri = |addr: &str| loopback_uri(addr.parse().unwrap());
        assert_eq!(uri("0.0.0.0:7000"), "http://127.0.0.1:7000");
        assert_eq!(uri("[::]:7000"), "http://[::1]:7000");
        assert_eq!(uri("10.0.0.5:7000"), "http://10.0.0.5:7000");
    }

    #[tokio::test]
    async fn test_loopback_channel_is_lazy() {
        // Nothing listens here; a lazy channel still builds
        assert!(loopback_channel("127.0.0.1:1".parse().unwrap()).is_ok());
    }
}
