//! Transport errors.

use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the listener or a stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP request head exceeded the configured limit.
    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// The peer did not finish sending its request head in time.
    #[error("Handshake timed out")]
    Timeout,

    /// The request head could not be parsed.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// No route matched the request target and there is no root route.
    #[error("No route for {0}")]
    NoRoute(String),

    /// The WebSocket handshake was refused.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The peer closed the stream before the handshake completed.
    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Whether the error is routine peer behaviour rather than a fault.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, TransportError::NoRoute(_) | TransportError::Closed)
    }
}
