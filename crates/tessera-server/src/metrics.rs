// Metrics module for observability
// Counters and histograms for the gRPC, HTTP and connection layers

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and describe all metrics
///
/// Call once at startup; the handle renders the `/metrics` payload.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    tracing::info!("Metrics initialized");
    Ok(handle)
}

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    // gRPC metrics
    describe_counter!("grpc_requests_total", "Total number of gRPC requests handled");
    describe_histogram!(
        "grpc_request_duration_seconds",
        "gRPC request duration in seconds"
    );

    // HTTP metrics
    describe_counter!(
        "http_requests_total",
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_counter!(
        "http_requests_errors_total",
        "Total number of HTTP request errors"
    );

    // Connection metrics
    describe_counter!(
        "connections_accepted_total",
        "Total number of accepted connections by detected protocol"
    );
    describe_gauge!("connections_active", "Currently open connections");

    // Discovery metrics
    describe_counter!(
        "tessera_registrations_total",
        "Registration attempts by outcome"
    );
    describe_counter!(
        "tessera_resolver_updates_total",
        "Address sets pushed by resolvers"
    );
    describe_counter!(
        "tessera_resolver_errors_total",
        "Failed health queries in resolver watch loops"
    );
    describe_gauge!(
        "tessera_resolver_addresses",
        "Addresses in the last set pushed per target"
    );
}

/// Record a finished gRPC call
pub fn record_grpc_request(method: &str, code: &str, duration_secs: f64) {
    counter!(
        "grpc_requests_total",
        "method" => method.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
    histogram!("grpc_request_duration_seconds", "method" => method.to_string())
        .record(duration_secs);
}

/// Record an HTTP request
pub fn record_http_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration_secs);

    if status >= 400 {
        counter!(
            "http_requests_errors_total",
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }
}

/// Record a connection routed to a protocol ("grpc", "http", "unknown")
pub fn record_connection(protocol: &'static str) {
    counter!("connections_accepted_total", "protocol" => protocol).increment(1);
}

/// Update the open connection gauge
pub fn set_active_connections(count: usize) {
    gauge!("connections_active").set(count as f64);
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
