//! Error types for the mock server.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by stub registration, rendering and the server lifecycle.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// A stub (or verification pattern) is invalid or contradictory.
    #[error("invalid stub configuration: {0}")]
    Configuration(String),

    /// A response template could not be rendered.
    #[error("failed to render response template: {0}")]
    Render(#[from] handlebars::RenderError),

    /// The listening socket could not be bound.
    #[error("failed to bind mock server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A connection delivered bytes that could not be read as a request.
    #[error("transport error from {peer}: {message}")]
    Transport { peer: SocketAddr, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MockServerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        MockServerError::Configuration(message.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MockServerError>;
