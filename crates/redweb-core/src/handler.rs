//! Message handlers and the factory table used to build them.
//!
//! A handler is a named, stateless dispatcher. One instance is created per
//! route and shared by every connection of that route, so anything
//! connection-specific must live on the [`Connection`] or in a registry the
//! handler owns, never in plain fields.

use crate::connection::{CloseReason, Connection, ConnectionError};
use crate::route::RouteError;
use redweb_protocol::{codec, Envelope};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors raised by handler code.
///
/// The `Display` text is sent to the client as `{"error": "<text>"}` before
/// the connection is closed.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler does not override `on_message`.
    #[error("Not yet implemented: {0}")]
    NotImplemented(String),

    /// The message body did not match what the handler expects.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// Sending to the connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Create a failure with a custom message.
    #[must_use]
    pub fn msg(message: impl fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

/// A named unit of message-processing logic.
///
/// On a per-message route the handler is selected by the envelope `type`
/// matching [`Handler::name`]. On a handler-assignment route a connection is
/// adopted once through [`Handler::on_adopt`] and from then on every raw frame
/// goes to [`Handler::on_frame`].
///
/// Handlers run on the connection's reader task and must not block.
pub trait Handler: Send + Sync + 'static {
    /// The handler name, matched against the envelope `type`.
    fn name(&self) -> &str;

    /// Process one decoded message.
    ///
    /// # Errors
    ///
    /// Any error closes the connection after replying with its message.
    fn on_message(&self, _conn: &Connection, _message: &Envelope) -> Result<(), HandlerError> {
        Err(HandlerError::NotImplemented(self.name().to_string()))
    }

    /// Runs once when a connection first becomes associated with the handler.
    fn on_initial_contact(&self, _conn: &Connection) {}

    /// Runs once when a connection this handler has seen is closed, after it
    /// has been deregistered from the route.
    fn on_close(&self, _conn: &Connection, _reason: CloseReason) {}

    /// Take ownership of a connection after a `__handlerConnect` handshake.
    ///
    /// `data` is the whole handshake `data` object.
    ///
    /// # Errors
    ///
    /// Any error closes the connection after replying with its message.
    fn on_adopt(&self, _conn: &Connection, _data: &Value) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Process a raw frame on a connection adopted by this handler.
    ///
    /// The default decodes the frame and forwards it to
    /// [`Handler::on_message`].
    ///
    /// # Errors
    ///
    /// Any error closes the connection after replying with its message.
    fn on_frame(&self, conn: &Connection, frame: &[u8]) -> Result<(), HandlerError> {
        let envelope = codec::decode(frame).map_err(HandlerError::msg)?;
        self.on_message(conn, &envelope)
    }
}

/// Builds a fresh handler instance.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

/// Wrap a constructor closure into a [`HandlerFactory`].
pub fn handler_factory<H, F>(make: F) -> HandlerFactory
where
    H: Handler,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(move || Arc::new(make()) as Arc<dyn Handler>)
}

/// A name-keyed table of handler factories.
///
/// Lets routes be assembled from configuration by handler name.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name, replacing any previous entry.
    pub fn register<H, F>(&mut self, name: impl Into<String>, make: F) -> &mut Self
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(handler = %name, "Registered handler factory");
        self.factories.insert(name, handler_factory(make));
        self
    }

    /// Look up a factory by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<HandlerFactory> {
        self.factories.get(name).cloned()
    }

    /// Resolve a list of names into factories.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownHandler`] for the first unknown name.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<HandlerFactory>, RouteError> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| RouteError::UnknownHandler(name.clone()))
            })
            .collect()
    }

    /// Get all registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("names", &self.names())
            .finish()
    }
}

/// Handler installed on the default root route.
///
/// Acknowledges every message with a JSON string describing it.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl DefaultHandler {
    /// Name the default handler answers to.
    pub const NAME: &'static str = "DefaultHandler";
}

impl Handler for DefaultHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_message(&self, conn: &Connection, message: &Envelope) -> Result<(), HandlerError> {
        let body = codec::encode(message).map_err(HandlerError::msg)?;
        conn.send_json(&format!("I got your message of {body}"))?;
        Ok(())
    }
}
