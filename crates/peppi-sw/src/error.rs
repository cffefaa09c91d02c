//! Error types for the worker engine.

use http::StatusCode;
use peppi_net::NetError;
use thiserror::Error;

/// Result type alias for worker operations.
pub type SwResult<T> = Result<T, SwError>;

/// Failures of the cache-store primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Quota exceeded: {needed} bytes requested, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Cache store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Bad response: {url} returned {status}")]
    BadStatus { url: String, status: StatusCode },

    #[error("State error: {0}")]
    State(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwError {
    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failure came from the network rather than local storage.
    pub fn is_network(&self) -> bool {
        matches!(self, SwError::Network(_))
    }
}
