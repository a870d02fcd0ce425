//! Error types for the discovery client

use thiserror::Error;

use crate::store::StoreError;

/// Discovery error types
#[derive(Debug, Error)]
pub enum Error {
    /// The store is unreachable or a handle was requested while not connected
    #[error("Connection error: {0}")]
    Connection(String),

    /// No children, or no healthy children, for a service
    #[error("Not found: {0}")]
    NotFound(String),

    /// Selection was attempted before any successful fetch
    #[error("Empty cache: {0}")]
    EmptyCache(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether a later fetch cycle may succeed without caller intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::EmptyCache(_) | Self::Store(StoreError::ConnectionLoss)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, Error>;
