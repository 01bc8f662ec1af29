//! Socket routes.
//!
//! A route owns one upgrade path, the handlers reachable on it, and the map of
//! live connections keyed by identity. It accepts connections handed over by
//! the transport, decodes their frames and dispatches them.
//!
//! ## Identity and eviction
//!
//! Connections are keyed by remote IP unless the route allows duplicates, in
//! which case each gets a fresh UUID key. Accepting a connection whose key is
//! already taken sends the previous holder a notice and closes it; the newest
//! connection always wins.

use crate::connection::{CloseReason, Connection, ConnectionError, ConnectionId, Outbound};
use crate::handler::{handler_factory, Handler, HandlerError, HandlerFactory};
use crate::hooks::{NoopHooks, RouteHooks};
use crate::service::{Service, ServiceHost};
use dashmap::DashMap;
use parking_lot::RwLock;
use redweb_protocol::{codec, Envelope, ErrorReply, Notice, ProtocolError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Route construction errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The path is empty.
    #[error("A path must be specified for the route")]
    EmptyPath,

    /// No handler factories were given.
    #[error("At least one handler must be specified for route {0}")]
    NoHandlers(String),

    /// A handler name is not present in the catalog.
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),
}

/// Why a frame was not handled normally.
///
/// The `Display` text is the `error` field sent to the client.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The frame could not be decoded or broke the handshake protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No handler matches the requested name.
    #[error("No such handler {0}")]
    NoSuchHandler(String),

    /// The handler returned an error or panicked.
    #[error("{message}")]
    HandlerFault {
        /// Handler that failed.
        handler: String,
        /// Failure message.
        message: String,
    },
}

impl DispatchError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Protocol(_) | DispatchError::NoSuchHandler(_) => "protocol_violation",
            DispatchError::HandlerFault { .. } => "handler_fault",
        }
    }

    fn close_reason(&self) -> CloseReason {
        match self {
            DispatchError::Protocol(_) | DispatchError::NoSuchHandler(_) => {
                CloseReason::ProtocolViolation
            }
            DispatchError::HandlerFault { .. } => CloseReason::HandlerFault,
        }
    }
}

/// How a route maps frames to handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Every frame is routed independently by its `type`.
    #[default]
    PerMessage,
    /// A connection is assigned to one handler by a `__handlerConnect`
    /// handshake and stays with it for its lifetime.
    HandlerAssignment,
}

/// Route configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Upgrade path, e.g. `/chat`.
    pub path: String,
    /// Key connections by a generated id instead of the remote IP.
    #[serde(default)]
    pub allow_duplicate_connections: bool,
    /// Dispatch policy.
    #[serde(default)]
    pub dispatch: DispatchPolicy,
}

impl RouteConfig {
    /// Create a per-message route configuration for `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            allow_duplicate_connections: false,
            dispatch: DispatchPolicy::PerMessage,
        }
    }

    /// Allow several connections from the same address.
    #[must_use]
    pub fn allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicate_connections = allow;
        self
    }

    /// Set the dispatch policy.
    #[must_use]
    pub fn dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// State shared between a route and the connections it owns.
pub(crate) struct RouteShared {
    config: RouteConfig,
    path: Arc<str>,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    clients: DashMap<String, Connection>,
    services: Vec<ServiceHost>,
    hooks: Arc<dyn RouteHooks>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl RouteShared {
    pub(crate) fn hooks(&self) -> &dyn RouteHooks {
        self.hooks.as_ref()
    }

    /// Remove `conn` from the client map if it still owns its key.
    pub(crate) fn deregister(&self, conn: &Connection) {
        self.clients
            .remove_if(conn.key(), |_, current| current.same_as(conn));
    }

    /// Queue a text frame for every registered connection except `exclude`.
    pub(crate) fn send_to_all(&self, text: &str, exclude: Option<ConnectionId>) -> usize {
        let count = self
            .clients
            .iter()
            .filter(|entry| Some(entry.value().id()) != exclude)
            .filter(|entry| entry.value().queue(text))
            .count();
        trace!(path = %self.path, recipients = count, "Broadcast");
        count
    }

    /// Tell every handler that has seen `conn` that it closed.
    pub(crate) fn notify_handlers(&self, conn: &Connection, reason: CloseReason) {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .iter()
            .filter(|h| conn.has_contacted(h.name()))
            .cloned()
            .collect();

        for handler in handlers {
            let closed = panic::catch_unwind(AssertUnwindSafe(|| handler.on_close(conn, reason)));
            if let Err(payload) = closed {
                warn!(
                    connection = %conn.id(),
                    handler = %handler.name(),
                    error = %panic_message(payload.as_ref()),
                    "Handler panicked while closing connection"
                );
            }
        }
    }

    fn find_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.name() == name)
            .cloned()
    }
}

/// A socket route.
///
/// Cheap to clone; all clones share the same handlers and connections.
#[derive(Clone)]
pub struct Route {
    shared: Arc<RouteShared>,
}

impl Route {
    /// Start building a route.
    #[must_use]
    pub fn builder(config: RouteConfig) -> RouteBuilder {
        RouteBuilder {
            config,
            handlers: Vec::new(),
            services: Vec::new(),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Create a route from a configuration and handler factories.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or no handlers are given.
    pub fn new(config: RouteConfig, handlers: Vec<HandlerFactory>) -> Result<Self, RouteError> {
        Self::builder(config).handler_factories(handlers).build()
    }

    pub(crate) fn downgrade(&self) -> Weak<RouteShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &Weak<RouteShared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Get the upgrade path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// Get the route configuration.
    #[must_use]
    pub fn config(&self) -> &RouteConfig {
        &self.shared.config
    }

    /// Get the names of the registered handlers, in registration order.
    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        self.shared
            .handlers
            .read()
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Register another handler.
    ///
    /// Returns `false`, leaving the route unchanged, if a handler with the same
    /// name already exists.
    pub fn add_handler(&self, factory: HandlerFactory) -> bool {
        let handler = factory();
        let mut handlers = self.shared.handlers.write();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            warn!(path = %self.path(), handler = %handler.name(), "Handler already exists");
            return false;
        }
        info!(path = %self.path(), handler = %handler.name(), "Handler added");
        handlers.push(handler);
        true
    }

    /// Start the route's services. Idempotent, and a no-op once the route
    /// has been shut down.
    ///
    /// Must be called from within a tokio runtime if any service ticks.
    pub fn start(&self) {
        if self.is_shut_down() || self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for service in &self.shared.services {
            service.on_init(self);
        }
        debug!(path = %self.path(), services = self.shared.services.len(), "Route started");
    }

    /// Check whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    /// Accept a new connection.
    ///
    /// `outbound` is drained by the transport writer. If another connection
    /// holds the same identity key it is notified and closed. A route that
    /// has been shut down returns the connection already closed.
    pub fn accept(
        &self,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Connection {
        let key = if self.shared.config.allow_duplicate_connections {
            Uuid::new_v4().to_string()
        } else {
            remote_addr.ip().to_string()
        };

        let conn = Connection::new(
            key.clone(),
            remote_addr,
            Arc::clone(&self.shared.path),
            outbound,
            self.downgrade(),
        );

        if self.is_shut_down() {
            debug!(
                path = %self.path(),
                remote = %remote_addr,
                "Refusing connection on shut down route"
            );
            conn.refuse();
            return conn;
        }

        if let Some(previous) = self.shared.clients.insert(key, conn.clone()) {
            warn!(
                path = %self.path(),
                key = %conn.key(),
                evicted = %previous.id(),
                "Client already connected, disconnecting existing connection"
            );
            self.shared.hooks.on_evict(&previous);
            let _ = previous.send_json(&Notice::superseded());
            previous.close_with(CloseReason::Evicted);
        }

        info!(
            path = %self.path(),
            connection = %conn.id(),
            remote = %remote_addr,
            "New client connected"
        );
        self.shared.hooks.on_open(&conn);

        // Lost a race with shutdown after the snapshot was taken.
        if self.is_shut_down() {
            conn.close_with(CloseReason::Shutdown);
        }
        conn
    }

    /// Handle one inbound frame from `conn`.
    ///
    /// Frames for a closed connection are dropped. Any protocol violation or
    /// handler fault replies with an error envelope and closes only `conn`.
    pub fn handle_frame(&self, conn: &Connection, frame: &[u8]) {
        if conn.is_closed() {
            trace!(connection = %conn.id(), "Dropping frame for closed connection");
            return;
        }

        let result = match self.shared.config.dispatch {
            DispatchPolicy::PerMessage => self.dispatch_message(conn, frame),
            DispatchPolicy::HandlerAssignment => self.dispatch_assigned(conn, frame),
        };

        if let Err(error) = result {
            self.reject(conn, &error);
        }
    }

    /// Deregister a connection after the transport observed a close or error.
    pub fn disconnect(&self, conn: &Connection, reason: CloseReason) {
        if conn.close_with(reason) {
            info!(path = %self.path(), connection = %conn.id(), "Client disconnected");
        }
    }

    /// Serialize a payload and send it to every registered connection.
    ///
    /// Returns the number of connections the frame was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn broadcast<T: Serialize + ?Sized>(&self, payload: &T) -> Result<usize, ConnectionError> {
        let text = codec::encode(payload)?;
        Ok(self.broadcast_text(&text))
    }

    /// Send a pre-encoded text frame to every registered connection.
    pub fn broadcast_text(&self, text: &str) -> usize {
        self.shared.send_to_all(text, None)
    }

    /// Get the connection registered under an identity key.
    #[must_use]
    pub fn connection(&self, key: &str) -> Option<Connection> {
        self.shared.clients.get(key).map(|c| c.value().clone())
    }

    /// Get a snapshot of all registered connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Connection> {
        self.shared
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Get the number of registered connections.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Stop all services and close all connections. Idempotent.
    ///
    /// Connections accepted afterwards are closed immediately.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        for service in &self.shared.services {
            service.on_shutdown();
        }

        let connections = self.connections();
        let count = connections.len();
        for conn in connections {
            conn.close_with(CloseReason::Shutdown);
        }
        info!(path = %self.path(), closed = count, "Route shut down");
    }

    fn dispatch_message(&self, conn: &Connection, frame: &[u8]) -> Result<(), DispatchError> {
        let envelope = codec::decode(frame)?;
        let handler = self
            .shared
            .find_handler(envelope.kind())
            .ok_or_else(|| DispatchError::NoSuchHandler(envelope.kind().to_string()))?;

        self.shared.hooks.on_dispatch(conn, handler.name());
        trace!(connection = %conn.id(), handler = %handler.name(), "Dispatch");

        guarded(handler.as_ref(), || {
            if conn.first_contact(handler.name()) {
                handler.on_initial_contact(conn);
            }
            handler.on_message(conn, &envelope)
        })
    }

    fn dispatch_assigned(&self, conn: &Connection, frame: &[u8]) -> Result<(), DispatchError> {
        if let Some(handler) = conn.assigned_handler() {
            return guarded(handler.as_ref(), || handler.on_frame(conn, frame));
        }

        let envelope: Envelope = codec::decode(frame)?;
        let handshake = codec::decode_handshake(&envelope)?;
        let handler = self
            .shared
            .find_handler(&handshake.handler_name)
            .ok_or_else(|| DispatchError::NoSuchHandler(handshake.handler_name.clone()))?;

        conn.assign(Arc::clone(&handler));
        self.shared.hooks.on_dispatch(conn, handler.name());
        debug!(connection = %conn.id(), handler = %handler.name(), "Connection assigned");

        guarded(handler.as_ref(), || {
            conn.first_contact(handler.name());
            handler.on_initial_contact(conn);
            handler.on_adopt(conn, &handshake.data)
        })
    }

    fn reject(&self, conn: &Connection, error: &DispatchError) {
        warn!(
            path = %self.path(),
            connection = %conn.id(),
            kind = error.kind(),
            error = %error,
            "Closing connection"
        );
        self.shared.hooks.on_error(conn, error);
        let _ = conn.send_json(&ErrorReply::new(error.to_string()));
        conn.close_with(error.close_reason());
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("config", &self.shared.config)
            .field("handlers", &self.handler_names())
            .field("services", &self.shared.services)
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Run handler code, turning both errors and panics into a fault.
fn guarded<F>(handler: &dyn Handler, f: F) -> Result<(), DispatchError>
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    let message = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(error)) => error.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    Err(DispatchError::HandlerFault {
        handler: handler.name().to_string(),
        message,
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Handler panicked".to_string()
    }
}

/// Builder for [`Route`].
pub struct RouteBuilder {
    config: RouteConfig,
    handlers: Vec<HandlerFactory>,
    services: Vec<Arc<dyn Service>>,
    hooks: Arc<dyn RouteHooks>,
}

impl RouteBuilder {
    /// Add a handler constructor.
    #[must_use]
    pub fn handler<H, F>(mut self, make: F) -> Self
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.handlers.push(handler_factory(make));
        self
    }

    /// Add prebuilt handler factories.
    #[must_use]
    pub fn handler_factories(mut self, factories: impl IntoIterator<Item = HandlerFactory>) -> Self {
        self.handlers.extend(factories);
        self
    }

    /// Attach a service.
    #[must_use]
    pub fn service(self, service: impl Service) -> Self {
        self.shared_service(Arc::new(service))
    }

    /// Attach a service that is also referenced elsewhere.
    #[must_use]
    pub fn shared_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Set the lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn RouteHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Validate the configuration and instantiate every handler once.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or no handlers were added.
    pub fn build(self) -> Result<Route, RouteError> {
        if self.config.path.is_empty() {
            return Err(RouteError::EmptyPath);
        }
        if self.handlers.is_empty() {
            return Err(RouteError::NoHandlers(self.config.path));
        }

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::with_capacity(self.handlers.len());
        for factory in &self.handlers {
            let handler = factory();
            if handlers.iter().any(|h| h.name() == handler.name()) {
                warn!(path = %self.config.path, handler = %handler.name(), "Handler already exists");
                continue;
            }
            handlers.push(handler);
        }

        Ok(Route {
            shared: Arc::new(RouteShared {
                path: Arc::from(self.config.path.as_str()),
                config: self.config,
                handlers: RwLock::new(handlers),
                clients: DashMap::new(),
                services: self.services.into_iter().map(ServiceHost::new).collect(),
                hooks: self.hooks,
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    /// Replies with the message it received.
    struct Echo {
        calls: Arc<AtomicUsize>,
    }

    impl Handler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn on_message(&self, conn: &Connection, message: &Envelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            conn.send_json(message)?;
            Ok(())
        }
    }

    /// Sends the message to every peer.
    #[derive(Clone)]
    struct Shout;

    impl Handler for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        fn on_message(&self, conn: &Connection, message: &Envelope) -> Result<(), HandlerError> {
            conn.broadcast(message)?;
            Ok(())
        }
    }

    #[derive(Clone)]
    struct Failing;

    impl Handler for Failing {
        fn name(&self) -> &str {
            "fail"
        }

        fn on_message(&self, _conn: &Connection, _message: &Envelope) -> Result<(), HandlerError> {
            Err(HandlerError::msg("boom"))
        }
    }

    #[derive(Clone)]
    struct Panicking;

    impl Handler for Panicking {
        fn name(&self) -> &str {
            "panic"
        }

        fn on_message(&self, _conn: &Connection, _message: &Envelope) -> Result<(), HandlerError> {
            panic!("handler exploded");
        }
    }

    /// Counts messages before handing them to the wrapped handler.
    struct Counted<H> {
        inner: H,
        calls: Arc<AtomicUsize>,
    }

    impl<H: Handler> Handler for Counted<H> {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn on_message(&self, conn: &Connection, message: &Envelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.on_message(conn, message)
        }
    }

    fn counted<H: Handler + Clone>(inner: H, calls: &Arc<AtomicUsize>) -> HandlerFactory {
        let calls = Arc::clone(calls);
        handler_factory(move || Counted {
            inner: inner.clone(),
            calls: Arc::clone(&calls),
        })
    }

    /// Records adoption and every raw frame after it.
    #[derive(Default)]
    struct Game {
        adopted: Arc<Mutex<Vec<Value>>>,
        frames: Arc<Mutex<Vec<String>>>,
        contacts: Arc<AtomicUsize>,
    }

    impl Handler for Game {
        fn name(&self) -> &str {
            "game"
        }

        fn on_initial_contact(&self, _conn: &Connection) {
            self.contacts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_adopt(&self, conn: &Connection, data: &Value) -> Result<(), HandlerError> {
            self.adopted.lock().push(data.clone());
            conn.send_json(&json!({"type": "welcome"}))?;
            Ok(())
        }

        fn on_frame(&self, _conn: &Connection, frame: &[u8]) -> Result<(), HandlerError> {
            self.frames
                .lock()
                .push(String::from_utf8_lossy(frame).into_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl RouteHooks for Recording {
        fn on_open(&self, conn: &Connection) {
            self.events.lock().push(format!("open {}", conn.id()));
        }

        fn on_close(&self, conn: &Connection, reason: CloseReason) {
            self.events
                .lock()
                .push(format!("close {} {}", conn.id(), reason.as_str()));
        }

        fn on_error(&self, _conn: &Connection, error: &DispatchError) {
            self.events.lock().push(format!("error {}", error.kind()));
        }
    }

    fn addr(ip: &str, port: u16) -> SocketAddr {
        format!("{ip}:{port}").parse().unwrap()
    }

    fn connect(
        route: &Route,
        remote: SocketAddr,
    ) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (route.accept(remote, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn text(value: Value) -> Outbound {
        Outbound::Text(value.to_string())
    }

    fn echo_route(calls: &Arc<AtomicUsize>) -> Route {
        let calls = Arc::clone(calls);
        Route::builder(RouteConfig::new("/chat"))
            .handler(move || Echo {
                calls: Arc::clone(&calls),
            })
            .handler(|| Shout)
            .handler(|| Failing)
            .handler(|| Panicking)
            .build()
            .unwrap()
    }

    #[test]
    fn test_route_requires_path_and_handlers() {
        assert!(matches!(
            Route::builder(RouteConfig::new("")).handler(|| Shout).build(),
            Err(RouteError::EmptyPath)
        ));
        let err = Route::new(RouteConfig::new("/nohandlers"), Vec::new()).unwrap_err();
        assert!(matches!(err, RouteError::NoHandlers(_)));
        assert_eq!(
            err.to_string(),
            "At least one handler must be specified for route /nohandlers"
        );
    }

    #[test]
    fn test_route_initializes_handlers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        assert_eq!(route.path(), "/chat");
        assert_eq!(route.handler_names(), vec!["echo", "shout", "fail", "panic"]);
    }

    #[test]
    fn test_add_handler_rejects_duplicate_names() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);

        assert!(!route.add_handler(handler_factory(|| Shout)));
        assert_eq!(route.handler_names().len(), 4);

        assert!(route.add_handler(handler_factory(Game::default)));
        assert_eq!(route.handler_names().last().unwrap(), "game");
    }

    #[test]
    fn test_dispatch_invokes_matching_handler_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shouts = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));
        let panics = Arc::new(AtomicUsize::new(0));

        let echo_calls = Arc::clone(&calls);
        let route = Route::builder(RouteConfig::new("/chat"))
            .handler(move || Echo {
                calls: Arc::clone(&echo_calls),
            })
            .handler_factories([
                counted(Shout, &shouts),
                counted(Failing, &fails),
                counted(Panicking, &panics),
            ])
            .build()
            .unwrap();
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 5000));

        route.handle_frame(&conn, br#"{"type":"echo","text":"hi"}"#);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shouts.load(Ordering::SeqCst), 0);
        assert_eq!(fails.load(Ordering::SeqCst), 0);
        assert_eq!(panics.load(Ordering::SeqCst), 0);
        assert_eq!(drain(&mut rx), vec![text(json!({"type": "echo", "text": "hi"}))]);
        assert!(!conn.is_closed());

        route.handle_frame(&conn, br#"{"type":"shout"}"#);

        assert_eq!(shouts.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fails.load(Ordering::SeqCst) + panics.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_json_closes_without_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 5000));

        route.handle_frame(&conn, b"{\"type\":\"echo\"");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            drain(&mut rx),
            vec![text(json!({"error": "Invalid JSON format"})), Outbound::Close]
        );
        assert!(conn.is_closed());
        assert_eq!(route.client_count(), 0);
    }

    #[test]
    fn test_unknown_type_replies_once_and_closes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 5000));

        route.handle_frame(&conn, br#"{"type":"NonExistentHandler","data":{}}"#);

        assert_eq!(
            drain(&mut rx),
            vec![
                text(json!({"error": "No such handler NonExistentHandler"})),
                Outbound::Close
            ]
        );
        assert!(route.connection("10.0.0.1").is_none());
    }

    #[test]
    fn test_missing_type_is_protocol_violation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 5000));

        route.handle_frame(&conn, br#"{"text":"hi"}"#);

        assert_eq!(
            drain(&mut rx),
            vec![text(json!({"error": "Missing message type"})), Outbound::Close]
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn test_no_dispatch_after_close() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (conn, _rx) = connect(&route, addr("10.0.0.1", 5000));

        route.handle_frame(&conn, b"garbage");
        route.handle_frame(&conn, br#"{"type":"echo"}"#);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_error_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (faulty, mut faulty_rx) = connect(&route, addr("10.0.0.1", 5000));
        let (healthy, mut healthy_rx) = connect(&route, addr("10.0.0.2", 5000));

        route.handle_frame(&faulty, br#"{"type":"fail"}"#);
        assert_eq!(
            drain(&mut faulty_rx),
            vec![text(json!({"error": "boom"})), Outbound::Close]
        );

        route.handle_frame(&healthy, br#"{"type":"echo","n":1}"#);
        assert_eq!(
            drain(&mut healthy_rx),
            vec![text(json!({"type": "echo", "n": 1}))]
        );
        assert_eq!(route.client_count(), 1);
    }

    #[test]
    fn test_handler_panic_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 5000));
        let (_other, _other_rx) = connect(&route, addr("10.0.0.2", 5000));

        route.handle_frame(&conn, br#"{"type":"panic"}"#);

        assert_eq!(
            drain(&mut rx),
            vec![text(json!({"error": "handler exploded"})), Outbound::Close]
        );
        assert_eq!(route.client_count(), 1);
    }

    #[test]
    fn test_same_key_evicts_all_predecessors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);

        let mut previous = Vec::new();
        for port in 0..5 {
            previous.push(connect(&route, addr("192.168.1.7", 6000 + port)));
        }
        let (latest, mut latest_rx) = previous.pop().unwrap();

        for (conn, mut rx) in previous {
            assert!(conn.is_closed());
            assert_eq!(
                drain(&mut rx),
                vec![
                    text(json!({"msg": redweb_protocol::SUPERSEDED_NOTICE})),
                    Outbound::Close
                ]
            );
        }

        assert_eq!(route.client_count(), 1);
        let registered = route.connection("192.168.1.7").unwrap();
        assert_eq!(registered.id(), latest.id());
        assert!(drain(&mut latest_rx).is_empty());
    }

    #[test]
    fn test_evicted_close_does_not_remove_successor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (old, _old_rx) = connect(&route, addr("10.0.0.1", 1));
        let (new, _new_rx) = connect(&route, addr("10.0.0.1", 2));

        route.disconnect(&old, CloseReason::ClientClosed);

        assert_eq!(route.connection("10.0.0.1").unwrap().id(), new.id());
    }

    #[test]
    fn test_duplicates_allowed_get_distinct_keys() {
        let route = Route::builder(RouteConfig::new("/lobby").allow_duplicates(true))
            .handler(|| Shout)
            .build()
            .unwrap();

        let (a, _a_rx) = connect(&route, addr("10.0.0.1", 1));
        let (b, _b_rx) = connect(&route, addr("10.0.0.1", 2));

        assert_ne!(a.key(), b.key());
        assert!(!a.is_closed());
        assert_eq!(route.client_count(), 2);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (sender, mut sender_rx) = connect(&route, addr("10.0.0.1", 1));
        let (_b, mut b_rx) = connect(&route, addr("10.0.0.2", 1));
        let (_c, mut c_rx) = connect(&route, addr("10.0.0.3", 1));

        route.handle_frame(&sender, br#"{"type":"shout","text":"hey"}"#);

        let expected = vec![text(json!({"type": "shout", "text": "hey"}))];
        assert!(drain(&mut sender_rx).is_empty());
        assert_eq!(drain(&mut b_rx), expected);
        assert_eq!(drain(&mut c_rx), expected);
    }

    #[test]
    fn test_route_broadcast_reaches_everyone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (_a, mut a_rx) = connect(&route, addr("10.0.0.1", 1));
        let (_b, mut b_rx) = connect(&route, addr("10.0.0.2", 1));

        let sent = route.broadcast(&json!({"type": "notice"})).unwrap();

        assert_eq!(sent, 2);
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[test]
    fn test_hooks_fire_in_lifecycle_order() {
        let hooks = Arc::new(Recording::default());
        let route = Route::builder(RouteConfig::new("/hooks"))
            .handler(|| Failing)
            .hooks(hooks.clone())
            .build()
            .unwrap();
        let (conn, _rx) = connect(&route, addr("10.0.0.1", 1));

        route.handle_frame(&conn, br#"{"type":"fail"}"#);
        route.disconnect(&conn, CloseReason::ClientClosed);

        let id = conn.id();
        assert_eq!(
            *hooks.events.lock(),
            vec![
                format!("open {id}"),
                "error handler_fault".to_string(),
                format!("close {id} handler_fault"),
            ]
        );
    }

    #[test]
    fn test_shutdown_closes_all_connections() {
        let calls = Arc::new(AtomicUsize::new(0));
        let route = echo_route(&calls);
        let (a, mut a_rx) = connect(&route, addr("10.0.0.1", 1));
        let (b, _b_rx) = connect(&route, addr("10.0.0.2", 1));

        route.shutdown();

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(route.client_count(), 0);
        assert_eq!(drain(&mut a_rx), vec![Outbound::Close]);
    }

    #[test]
    fn test_accept_after_shutdown_is_closed() {
        let hooks = Arc::new(Recording::default());
        let route = Route::builder(RouteConfig::new("/late"))
            .handler(|| Shout)
            .hooks(hooks.clone())
            .build()
            .unwrap();

        route.shutdown();
        let (conn, mut rx) = connect(&route, addr("10.0.0.9", 1));

        assert!(route.is_shut_down());
        assert!(conn.is_closed());
        assert_eq!(route.client_count(), 0);
        assert_eq!(drain(&mut rx), vec![Outbound::Close]);
        assert!(hooks.events.lock().is_empty());

        route.handle_frame(&conn, br#"{"type":"shout"}"#);
        assert!(drain(&mut rx).is_empty());
    }

    fn game_route(game: Game) -> Route {
        let adopted = Arc::clone(&game.adopted);
        let frames = Arc::clone(&game.frames);
        let contacts = Arc::clone(&game.contacts);
        Route::builder(RouteConfig::new("/game").dispatch(DispatchPolicy::HandlerAssignment))
            .handler(move || Game {
                adopted: Arc::clone(&adopted),
                frames: Arc::clone(&frames),
                contacts: Arc::clone(&contacts),
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_handshake_assigns_connection() {
        let game = Game::default();
        let adopted = Arc::clone(&game.adopted);
        let frames = Arc::clone(&game.frames);
        let contacts = Arc::clone(&game.contacts);
        let route = game_route(game);
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 1));

        route.handle_frame(
            &conn,
            br#"{"type":"__handlerConnect","data":{"handlerName":"game","seat":2}}"#,
        );
        assert!(conn.is_assigned());
        assert_eq!(contacts.load(Ordering::SeqCst), 1);
        assert_eq!(
            *adopted.lock(),
            vec![json!({"handlerName": "game", "seat": 2})]
        );
        assert_eq!(drain(&mut rx), vec![text(json!({"type": "welcome"}))]);

        route.handle_frame(&conn, b"not even json");
        route.handle_frame(&conn, br#"{"type":"__handlerConnect"}"#);
        assert_eq!(
            *frames.lock(),
            vec![
                "not even json".to_string(),
                r#"{"type":"__handlerConnect"}"#.to_string()
            ]
        );
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_message_before_handshake_is_violation() {
        let route = game_route(Game::default());
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 1));

        route.handle_frame(&conn, br#"{"type":"move","x":1}"#);

        let out = drain(&mut rx);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Outbound::Close);
        assert!(conn.is_closed());
        assert!(!conn.is_assigned());
    }

    #[test]
    fn test_handshake_to_unknown_handler() {
        let route = game_route(Game::default());
        let (conn, mut rx) = connect(&route, addr("10.0.0.1", 1));

        route.handle_frame(
            &conn,
            br#"{"type":"__handlerConnect","data":{"handlerName":"poker"}}"#,
        );

        assert_eq!(
            drain(&mut rx),
            vec![text(json!({"error": "No such handler poker"})), Outbound::Close]
        );
    }
}
