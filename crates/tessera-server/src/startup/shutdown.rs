//! Graceful shutdown handling
//!
//! Process signals cancel the root [`CancellationToken`]; the server then
//! runs a [`ShutdownSequence`] of named steps, strictly in order, each bounded
//! by a deadline. A failing step is logged and recorded, never fatal.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ServerError;

/// Cancel `token` on Ctrl+C or SIGTERM
///
/// The listener exits quietly if the token is cancelled by someone else.
pub fn spawn_signal_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    })
}

/// Outcome of one shutdown step
#[derive(Debug)]
pub struct StepOutcome {
    pub name: String,
    pub elapsed: Duration,
    pub error: Option<ServerError>,
}

/// Result of a full shutdown sequence
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub steps: Vec<StepOutcome>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Ordered list of named shutdown steps
pub struct ShutdownSequence {
    step_timeout: Duration,
    steps: Vec<(String, BoxFuture<'static, anyhow::Result<()>>)>,
}

impl ShutdownSequence {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            step_timeout,
            steps: Vec::new(),
        }
    }

    /// Append a step; the future is not polled until its turn
    pub fn step<F>(mut self, name: impl Into<String>, step: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((name.into(), Box::pin(step)));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order
    pub async fn run(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for (name, step) in self.steps {
            let started = Instant::now();
            let error = match tokio::time::timeout(self.step_timeout, step).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("deadline of {:?} exceeded", self.step_timeout)),
            };
            let elapsed = started.elapsed();

            let error = error.map(|reason| {
                warn!(step = %name, reason = %reason, "Shutdown step failed");
                ServerError::ShutdownStepFailed {
                    step: name.clone(),
                    reason,
                }
            });
            if error.is_none() {
                info!(step = %name, elapsed = ?elapsed, "Shutdown step completed");
            }

            report.steps.push(StepOutcome {
                name,
                elapsed,
                error,
            });
        }

        report
    }
}
