//! Decoded inbound envelopes.

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// A decoded inbound JSON object together with its `type` discriminator.
///
/// The body keeps every field of the original object, `type` included, so a
/// handler that replies with the envelope sends back exactly what it received.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: String,
    body: Value,
}

impl Envelope {
    /// Create an envelope from a message type and a full JSON body.
    #[must_use]
    pub fn new(kind: impl Into<String>, body: Value) -> Self {
        Self {
            kind: kind.into(),
            body,
        }
    }

    /// Get the message type used for dispatch.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Get the full decoded object.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Get a single top-level field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// Deserialize the body into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    /// Check whether this is the reserved handler assignment request.
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        self.kind == crate::frames::HANDLER_CONNECT
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}
