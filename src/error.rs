//! Error types for the dispatcher.

use thiserror::Error;

/// Errors produced by the server pool, the strategies and the factory.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// An endpoint with the same normalized identity is already registered.
    #[error("server already exists: {0}")]
    DuplicateServer(String),

    /// The endpoint is not registered.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Selection was attempted on an empty pool.
    #[error("no servers registered")]
    NoServersRegistered,

    /// Every registered server is currently unhealthy.
    #[error("no healthy servers available")]
    NoHealthyServers,

    /// The factory does not know the requested strategy.
    #[error("unsupported load balancer strategy: {0}")]
    UnsupportedStrategy(String),

    /// The endpoint is not an absolute `scheme://authority[/prefix]` URL.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BalancerError {
    /// True for the errors that mean "nothing to route to right now".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BalancerError::NoServersRegistered | BalancerError::NoHealthyServers
        )
    }
}

/// Result alias used throughout the crate.
pub type BalancerResult<T> = Result<T, BalancerError>;
