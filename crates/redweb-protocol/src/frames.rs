//! Server-originated frames and the reserved handshake request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type of the handler assignment handshake.
pub const HANDLER_CONNECT: &str = "__handlerConnect";

/// Text sent to a connection that is superseded by a newer one.
pub const SUPERSEDED_NOTICE: &str =
    "You are being disconnected because a new client is connected with your IP address.";

/// Error reply, `{"error": "<message>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable error message.
    pub error: String,
}

impl ErrorReply {
    /// Create a new error reply.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Informational notice, `{"msg": "<text>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Notice text.
    pub msg: String,
}

impl Notice {
    /// Create a new notice.
    #[must_use]
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }

    /// Notice sent to a connection evicted by a newer one with the same key.
    #[must_use]
    pub fn superseded() -> Self {
        Self::new(SUPERSEDED_NOTICE)
    }
}

/// A decoded `__handlerConnect` request.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// Name of the handler the connection asks to be assigned to.
    pub handler_name: String,
    /// The whole `data` object, `handlerName` included.
    pub data: Value,
}
