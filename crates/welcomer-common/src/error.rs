//! Error types for welcomer-images
//!
//! This module defines the common error type shared by the service crates.

use thiserror::Error;

/// Common result type
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid colour: {0}")]
    InvalidColour(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether the caller is at fault
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::InvalidColour(_) | Self::Unauthorized
        )
    }

    /// Get HTTP status code
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::InvalidColour(_) => 400,
            Self::Unauthorized => 401,
            Self::ShuttingDown => 503,
            Self::Io(_) | Self::Configuration(_) | Self::Internal(_) => 500,
        }
    }
}
