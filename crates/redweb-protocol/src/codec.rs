//! Codec for decoding inbound envelopes and encoding outbound frames.
//!
//! Frames are single JSON documents; there is no buffering across frames.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::frames::{Handshake, HANDLER_CONNECT};

/// Protocol errors that can occur during encoding/decoding.
///
/// The `Display` text of each variant is what the client receives in the
/// `error` field of the reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("Invalid JSON format")]
    InvalidJson(#[source] serde_json::Error),

    /// The frame is JSON but has no string `type` field.
    #[error("Missing message type")]
    MissingType,

    /// A message other than the handshake arrived on an unassigned connection,
    /// or the handshake itself is malformed.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Outbound serialization error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Decode an inbound frame into an envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidJson`] if the bytes are not JSON and
/// [`ProtocolError::MissingType`] if the document is not an object with a
/// string `type`.
pub fn decode(frame: &[u8]) -> Result<Envelope, ProtocolError> {
    let body: Value = serde_json::from_slice(frame).map_err(ProtocolError::InvalidJson)?;

    let kind = match body.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(ProtocolError::MissingType),
    };

    Ok(Envelope::new(kind, body))
}

/// Extract the handler assignment request from an envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidHandshake`] if the envelope is not a
/// `__handlerConnect` message or carries no `data.handlerName` string.
pub fn decode_handshake(envelope: &Envelope) -> Result<Handshake, ProtocolError> {
    if !envelope.is_handshake() {
        return Err(ProtocolError::InvalidHandshake(format!(
            "expected {HANDLER_CONNECT}, got {}",
            envelope.kind()
        )));
    }

    let data = envelope
        .field("data")
        .cloned()
        .ok_or_else(|| ProtocolError::InvalidHandshake("missing data".into()))?;

    let handler_name = data
        .get("handlerName")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidHandshake("missing data.handlerName".into()))?
        .to_string();

    Ok(Handshake { handler_name, data })
}

/// Encode an outbound payload as a JSON text frame.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(payload).map_err(ProtocolError::Encode)
}
