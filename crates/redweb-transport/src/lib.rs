//! # redweb-transport
//!
//! WebSocket transport for RedWeb routers.
//!
//! A [`WebSocketListener`] accepts TCP connections, reads each upgrade
//! request head, asks the [`Router`](redweb_core::Router) for a route and
//! either completes the handshake or drops the stream without a reply.
//!
//! ```rust,ignore
//! use redweb_transport::{ListenerConfig, WebSocketListener};
//!
//! let router = Arc::new(Router::new(routes)?);
//! let listener = WebSocketListener::bind(ListenerConfig::default(), router).await?;
//! listener.run().await?;
//! ```
//!
//! Streams accepted elsewhere (for example behind a TLS acceptor) can be
//! passed to [`handle_upgrade`] directly.

pub mod error;
pub mod listener;
pub mod upgrade;
pub mod websocket;

pub use error::TransportError;
pub use listener::{ListenerConfig, ShutdownHandle, WebSocketListener};
pub use upgrade::{handle_upgrade, read_request, upgrade, UpgradeRequest};
pub use websocket::serve_connection;
