//! # redweb-protocol
//!
//! Wire format spoken on every RedWeb socket route.
//!
//! Every application frame is a UTF-8 JSON object. Inbound objects carry a
//! `type` discriminator that selects the handler; outbound errors are always
//! `{"error": "<message>"}`.
//!
//! ## Frames
//!
//! - [`Envelope`] - A decoded inbound object plus its `type`
//! - [`Handshake`] - The reserved `__handlerConnect` assignment request
//! - [`ErrorReply`] / [`Notice`] - Server-originated control replies
//!
//! ## Example
//!
//! ```rust
//! use redweb_protocol::codec;
//!
//! let envelope = codec::decode(br#"{"type":"echo","text":"hi"}"#).unwrap();
//! assert_eq!(envelope.kind(), "echo");
//! assert_eq!(envelope.field("text").and_then(|v| v.as_str()), Some("hi"));
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;

pub use codec::{decode, decode_handshake, encode, ProtocolError};
pub use envelope::Envelope;
pub use frames::{ErrorReply, Handshake, Notice, HANDLER_CONNECT, SUPERSEDED_NOTICE};
