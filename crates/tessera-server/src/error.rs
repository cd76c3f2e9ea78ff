//! Error types for the server crate

use tessera_discovery::DiscoveryError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be opened; fatal at startup
    #[error("failed to bind listener on {endpoint}: {source}")]
    ListenerBindFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// A shutdown step failed or exceeded its deadline; later steps still run
    #[error("shutdown step '{step}' failed: {reason}")]
    ShutdownStepFailed { step: String, reason: String },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failure_display() {
        let err = ServerError::ListenerBindFailed {
            endpoint: "0.0.0.0:80".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(
            err.to_string(),
            "failed to bind listener on 0.0.0.0:80: denied"
        );
    }

    #[test]
    fn test_shutdown_step_display() {
        let err = ServerError::ShutdownStepFailed {
            step: "grpc".to_string(),
            reason: "deadline exceeded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "shutdown step 'grpc' failed: deadline exceeded"
        );
    }

    #[test]
    fn test_discovery_error_is_transparent() {
        let err: ServerError = DiscoveryError::Closed.into();
        assert_eq!(err.to_string(), "resolver closed");
    }
}
