//! Tessera Server
//!
//! Hosts gRPC services and an HTTP/1 side (metrics and REST gateway) on one
//! socket, registers the instance with the discovery backend, and shuts down
//! in a fixed order on SIGINT/SIGTERM.

pub mod error; // Error handling and types
pub mod exit; // Exit hook chain
pub mod health; // Serving state and health watchers
pub mod metrics; // Metrics and observability
pub mod model; // Configuration models
pub mod server; // Multiplexed gRPC + HTTP server
pub mod startup; // Logging and shutdown utilities

pub use error::{Result, ServerError};
pub use exit::ExitHooks;
pub use health::{HealthReporter, HealthState, HealthWatcher};
pub use model::{AppConfig, Cli};
pub use server::{
    BoundServer, GatewayError, GatewayResult, Server, ServiceRegistrar, grpc_request,
};
