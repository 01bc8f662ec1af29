//! Live socket connections owned by a route.
//!
//! A [`Connection`] is a cheap, cloneable handle. The transport layer feeds it
//! an outbound queue at accept time and drains that queue into the socket;
//! everything above the transport only ever talks to the handle.

use crate::handler::Handler;
use crate::route::RouteShared;
use parking_lot::Mutex;
use redweb_protocol::{codec, ProtocolError};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// Unique identifier for a single accepted connection.
///
/// Distinct from the identity key: two connections evicting each other share
/// a key but never an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// An item queued for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame.
    Text(String),
    /// Close the socket after everything queued before it.
    Close,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket.
    ClientClosed,
    /// A newer connection took over the identity key.
    Evicted,
    /// The peer sent a frame the route cannot accept.
    ProtocolViolation,
    /// A handler failed while processing a frame.
    HandlerFault,
    /// The transport reported an error.
    Transport,
    /// Handler or application code closed the connection.
    Server,
    /// The route is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Evicted => "evicted",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::HandlerFault => "handler_fault",
            CloseReason::Transport => "transport",
            CloseReason::Server => "server",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is already closed.
    #[error("Connection closed")]
    Closed,

    /// The payload could not be serialized.
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

struct ConnectionInner {
    id: ConnectionId,
    key: String,
    remote_addr: SocketAddr,
    path: Arc<str>,
    outbound: mpsc::UnboundedSender<Outbound>,
    route: Weak<RouteShared>,
    closed: watch::Sender<bool>,
    assigned: OnceLock<Arc<dyn Handler>>,
    contacted: Mutex<HashSet<String>>,
}

/// A handle to a live socket registered with a route.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        key: String,
        remote_addr: SocketAddr,
        path: Arc<str>,
        outbound: mpsc::UnboundedSender<Outbound>,
        route: Weak<RouteShared>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::generate(),
                key,
                remote_addr,
                path,
                outbound,
                route,
                closed,
                assigned: OnceLock::new(),
                contacted: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Get the identity key the connection is registered under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Get the peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Get the path of the route that owns this connection.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Check whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Check whether the connection has been handed to a single handler.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        self.inner.assigned.get().is_some()
    }

    /// Get the handler this connection is assigned to, if any.
    #[must_use]
    pub fn assigned_handler(&self) -> Option<Arc<dyn Handler>> {
        self.inner.assigned.get().cloned()
    }

    /// Serialize a payload and send it to this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the payload cannot be
    /// serialized.
    pub fn send_json<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let text = codec::encode(payload)?;
        self.send_text(text)
    }

    /// Send a pre-encoded text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.inner
            .outbound
            .send(Outbound::Text(text))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Serialize a payload and send it to every other connection of the route.
    ///
    /// Returns the number of peers the frame was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn broadcast<T: Serialize + ?Sized>(&self, payload: &T) -> Result<usize, ConnectionError> {
        let text = codec::encode(payload)?;
        let Some(route) = self.inner.route.upgrade() else {
            return Ok(0);
        };
        Ok(route.send_to_all(&text, Some(self.inner.id)))
    }

    /// Close the connection from application code.
    pub fn close(&self) {
        self.close_with(CloseReason::Server);
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Mark the connection closed, deregister it and notify the route hooks
    /// and every handler that has seen it.
    ///
    /// Returns `false` if it was already closed.
    pub(crate) fn close_with(&self, reason: CloseReason) -> bool {
        if self.inner.closed.send_replace(true) {
            return false;
        }

        let _ = self.inner.outbound.send(Outbound::Close);
        debug!(
            connection = %self.inner.id,
            key = %self.inner.key,
            path = %self.inner.path,
            reason = reason.as_str(),
            "Connection closed"
        );

        if let Some(route) = self.inner.route.upgrade() {
            route.deregister(self);
            route.hooks().on_close(self, reason);
            route.notify_handlers(self, reason);
        }
        true
    }

    /// Close a connection that was never registered. No hooks fire.
    pub(crate) fn refuse(&self) {
        if !self.inner.closed.send_replace(true) {
            let _ = self.inner.outbound.send(Outbound::Close);
        }
    }

    /// Permanently assign the connection to a handler.
    ///
    /// Returns `false` if it was already assigned.
    pub(crate) fn assign(&self, handler: Arc<dyn Handler>) -> bool {
        self.inner.assigned.set(handler).is_ok()
    }

    /// Record that `handler` has seen this connection.
    ///
    /// Returns `true` the first time for a given handler name.
    pub(crate) fn first_contact(&self, handler: &str) -> bool {
        self.inner.contacted.lock().insert(handler.to_string())
    }

    pub(crate) fn has_contacted(&self, handler: &str) -> bool {
        self.inner.contacted.lock().contains(handler)
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        self.inner.id == other.inner.id
    }

    pub(crate) fn queue(&self, text: &str) -> bool {
        !self.is_closed() && self.inner.outbound.send(Outbound::Text(text.to_string())).is_ok()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("remote_addr", &self.inner.remote_addr)
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .field("assigned", &self.is_assigned())
            .finish()
    }
}
