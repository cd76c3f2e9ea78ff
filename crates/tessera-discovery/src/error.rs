//! Error types for the discovery crate

use std::time::Duration;

/// Errors raised by the discovery adapter, registrar and resolvers
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Resolver target could not be parsed; no network call was made
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// No resolver builder registered for the scheme
    #[error("no resolver registered for scheme '{0}'")]
    UnknownScheme(String),

    /// Backend could not be reached (connect failure, timeout, reset)
    #[error("discovery backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend answered with a non-success status
    #[error("discovery backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    /// Backend response could not be decoded
    #[error("failed to decode backend response: {0}")]
    Decode(String),

    /// Registration did not succeed within the retry window
    #[error("registration of '{id}' failed after {attempts} attempts in {elapsed:?}: {source}")]
    RegistrationFailed {
        id: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<DiscoveryError>,
    },

    /// Operation attempted on a closed resolver or channel
    #[error("resolver closed")]
    Closed,
}

impl DiscoveryError {
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BackendUnavailable(_) => true,
            Self::Backend { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Backend {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::BackendUnavailable(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
