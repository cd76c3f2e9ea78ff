//! Health reporter
//!
//! Tracks the server's SERVING / NOT_SERVING state, fans transitions out to
//! watchers, and serves it as `grpc.health.v1.Health` so the discovery
//! backend's gRPC check sees the same state. Every watcher stream, local or
//! remote, ends right after the NOT_SERVING transition.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};
use tracing::{debug, info};

/// Serving state of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Serving,
    NotServing,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Serving => write!(f, "SERVING"),
            HealthState::NotServing => write!(f, "NOT_SERVING"),
        }
    }
}

impl From<HealthState> for ServingStatus {
    fn from(state: HealthState) -> Self {
        match state {
            HealthState::Serving => ServingStatus::Serving,
            HealthState::NotServing => ServingStatus::NotServing,
        }
    }
}

/// Stream of health states; the first item is the state at subscribe time
pub type HealthWatcher = mpsc::UnboundedReceiver<HealthState>;

struct Inner {
    state: HealthState,
    subscribers: Vec<mpsc::UnboundedSender<HealthState>>,
}

pub struct HealthReporter {
    inner: Mutex<Inner>,
    services: Vec<String>,
}

impl HealthReporter {
    /// Create a reporter in the SERVING state
    ///
    /// `services` are the gRPC health service names answered besides the
    /// overall server name `""`.
    pub fn new(services: Vec<String>) -> Self {
        let mut names = vec![String::new()];
        names.extend(services.into_iter().filter(|s| !s.is_empty()));
        Self {
            inner: Mutex::new(Inner {
                state: HealthState::Serving,
                subscribers: Vec::new(),
            }),
            services: names,
        }
    }

    /// Current state, side-effect free
    pub fn check(&self) -> HealthState {
        self.inner.lock().state
    }

    /// Whether `service` is a name this reporter answers for
    pub fn knows(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }

    /// Subscribe to state transitions
    ///
    /// The current state is queued under the same lock that guards
    /// transitions, so a subscriber never misses one.
    pub fn watch(&self) -> HealthWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        // Receiver is alive, so this send cannot fail
        let _ = tx.send(inner.state);
        if inner.state == HealthState::Serving {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Transition to NOT_SERVING
    ///
    /// Happens exactly once; returns false if already shut down. Every active
    /// watcher has the transition queued before this returns, after which
    /// the watcher streams end.
    pub fn shutdown(&self) -> bool {
        let subscribers = {
            let mut inner = self.inner.lock();
            if inner.state == HealthState::NotServing {
                return false;
            }
            inner.state = HealthState::NotServing;
            std::mem::take(&mut inner.subscribers)
        };

        let mut delivered = 0usize;
        for subscriber in subscribers {
            if subscriber.send(HealthState::NotServing).is_ok() {
                delivered += 1;
            }
        }

        info!(watchers = delivered, "Health status set to NOT_SERVING");
        true
    }

    /// `grpc.health.v1.Health` service backed by this reporter
    pub fn service(self: &Arc<Self>) -> HealthServer<HealthService> {
        HealthServer::new(HealthService {
            reporter: self.clone(),
        })
    }
}

/// gRPC face of a [`HealthReporter`]
pub struct HealthService {
    reporter: Arc<HealthReporter>,
}

fn response(status: ServingStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: status as i32,
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        if !self.reporter.knows(&service) {
            return Err(Status::not_found(format!("unknown service '{}'", service)));
        }
        Ok(Response::new(response(self.reporter.check().into())))
    }

    type WatchStream = BoxStream<'static, Result<HealthCheckResponse, Status>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let service = request.into_inner().service;
        let known = self.reporter.knows(&service);
        debug!(service = %service, known, "Health watch opened");

        let stream = UnboundedReceiverStream::new(self.reporter.watch()).map(move |state| {
            let status = if known {
                state.into()
            } else {
                ServingStatus::ServiceUnknown
            };
            Ok(response(status))
        });
        Ok(Response::new(stream.boxed()))
    }
}
