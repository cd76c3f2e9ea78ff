//! gRPC side of the multiplexed server

use std::io;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::service::RoutesBuilder;
use tower::{Layer, Service};
use tracing::{Level, debug, error, info, warn};

use super::listener::LimitedStream;
use crate::metrics::{Timer, record_grpc_request};
use crate::startup::logging::ACCESS_TARGET;

/// Log level for a finished call with the given status code
pub fn code_to_level(code: Code) -> Level {
    match code {
        Code::Ok => Level::INFO,
        Code::Unauthenticated | Code::PermissionDenied => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Status code of a response, read from its headers
///
/// Trailers-only responses (every handler error) carry `grpc-status` in the
/// headers; a successful call only reports it in trailers, so absence means OK.
fn response_code(headers: &http::HeaderMap) -> Code {
    headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
        .map(Code::from)
        .unwrap_or(Code::Ok)
}

/// Tower layer logging every gRPC call with a level chosen by status code
#[derive(Debug, Clone, Copy)]
pub struct GrpcLogLayer {
    log_payloads: bool,
}

impl GrpcLogLayer {
    pub fn new(log_payloads: bool) -> Self {
        Self { log_payloads }
    }
}

impl<S> Layer<S> for GrpcLogLayer {
    type Service = GrpcLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcLogService {
            inner,
            log_payloads: self.log_payloads,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GrpcLogService<S> {
    inner: S,
    log_payloads: bool,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for GrpcLogService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // Use the instance that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let method = req.uri().path().to_string();
        if self.log_payloads {
            debug!(
                target: ACCESS_TARGET,
                method = %method,
                metadata = ?req.headers(),
                "gRPC request"
            );
        }

        Box::pin(async move {
            let timer = Timer::new();
            let result = inner.call(req).await;
            let elapsed = timer.elapsed();

            match &result {
                Ok(response) => {
                    let code = response_code(response.headers());
                    record_grpc_request(&method, &format!("{:?}", code), elapsed.as_secs_f64());
                    let level = code_to_level(code);
                    if level == Level::INFO {
                        info!(
                            target: ACCESS_TARGET,
                            method = %method,
                            code = ?code,
                            elapsed = ?elapsed,
                            "finished call"
                        );
                    } else if level == Level::WARN {
                        warn!(
                            target: ACCESS_TARGET,
                            method = %method,
                            code = ?code,
                            elapsed = ?elapsed,
                            "finished call"
                        );
                    } else {
                        error!(
                            target: ACCESS_TARGET,
                            method = %method,
                            code = ?code,
                            elapsed = ?elapsed,
                            "finished call"
                        );
                    }
                }
                Err(e) => {
                    record_grpc_request(&method, "Transport", elapsed.as_secs_f64());
                    error!(
                        target: ACCESS_TARGET,
                        method = %method,
                        error = %e,
                        elapsed = ?elapsed,
                        "call failed"
                    );
                }
            }

            result
        })
    }
}

/// Spawn the gRPC serve loop over connections routed by the demux
///
/// In-flight calls are drained once `stop` is cancelled.
pub fn spawn(
    routes: RoutesBuilder,
    log_layer: GrpcLogLayer,
    incoming: mpsc::Receiver<io::Result<LimitedStream>>,
    stop: CancellationToken,
) -> JoinHandle<Result<(), tonic::transport::Error>> {
    let router = tonic::transport::Server::builder()
        .layer(log_layer)
        .add_routes(routes.routes());

    tokio::spawn(async move {
        let result = router
            .serve_with_incoming_shutdown(ReceiverStream::new(incoming), stop.cancelled_owned())
            .await;
        match &result {
            Ok(()) => info!("gRPC server stopped"),
            Err(e) => error!(error = %e, "gRPC server error"),
        }
        result
    })
}
