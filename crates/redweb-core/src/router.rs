//! Path-based demultiplexing of upgrade requests across routes.
//!
//! The router does not own a socket. The transport asks it to
//! [`resolve`](Router::resolve) the request target of every upgrade and either
//! completes the handshake for the returned route or drops the stream.

use crate::connection::ConnectionError;
use crate::handler::DefaultHandler;
use crate::route::{Route, RouteConfig, RouteError};
use parking_lot::RwLock;
use redweb_protocol::codec;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

/// Path of the fallback route.
pub const ROOT_PATH: &str = "/";

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A route is already registered at this path.
    #[error("A route is already registered at {0}")]
    DuplicatePath(String),

    /// Route construction failed.
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of registered routes.
    pub routes: usize,
    /// Number of live connections across all routes.
    pub connections: usize,
}

/// Matches upgrade requests to routes.
#[derive(Debug)]
pub struct Router {
    routes: RwLock<Vec<Route>>,
    shut_down: AtomicBool,
}

impl Router {
    /// Create a router from a list of routes.
    ///
    /// An empty list installs a root route served by [`DefaultHandler`].
    /// Every route's services are started, so this must run inside a tokio
    /// runtime if any of them tick.
    ///
    /// # Errors
    ///
    /// Returns an error if two routes share a path.
    pub fn new(routes: Vec<Route>) -> Result<Self, RouterError> {
        let router = Self {
            routes: RwLock::new(Vec::with_capacity(routes.len().max(1))),
            shut_down: AtomicBool::new(false),
        };

        if routes.is_empty() {
            router.add_route(default_route()?)?;
        }
        for route in routes {
            router.add_route(route)?;
        }

        info!(routes = router.routes.read().len(), "Router created");
        Ok(router)
    }

    /// Register a route and start its services.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicatePath`] if the path is taken.
    pub fn add_route(&self, route: Route) -> Result<(), RouterError> {
        {
            let mut routes = self.routes.write();
            if routes.iter().any(|r| r.path() == route.path()) {
                return Err(RouterError::DuplicatePath(route.path().to_string()));
            }
            routes.push(route.clone());
        }

        route.start();
        debug!(path = %route.path(), handlers = ?route.handler_names(), "Route added");
        Ok(())
    }

    /// Find the route for an upgrade request target.
    ///
    /// The target's query string is ignored. An exact path match wins;
    /// otherwise the root route is used if one is registered. A router that
    /// has been shut down resolves nothing.
    #[must_use]
    pub fn resolve(&self, target: &str) -> Option<Route> {
        if self.is_shut_down() {
            debug!(target = %target, "Router shut down, not resolving");
            return None;
        }
        let path = normalize_path(target);
        let routes = self.routes.read();

        let found = routes
            .iter()
            .find(|r| r.path() == path)
            .or_else(|| routes.iter().find(|r| r.path() == ROOT_PATH))
            .cloned();

        match &found {
            Some(route) => trace!(target = %target, path = %route.path(), "Resolved route"),
            None => debug!(target = %target, "No route for upgrade request"),
        }
        found
    }

    /// Get the route registered at exactly `path`.
    #[must_use]
    pub fn route(&self, path: &str) -> Option<Route> {
        self.routes.read().iter().find(|r| r.path() == path).cloned()
    }

    /// Get all registered routes, in registration order.
    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().clone()
    }

    /// Serialize a payload once and send it to every connection of every route.
    ///
    /// Returns the number of connections the frame was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn broadcast<T: Serialize + ?Sized>(&self, payload: &T) -> Result<usize, ConnectionError> {
        let text = codec::encode(payload)?;
        let sent = self
            .routes()
            .iter()
            .map(|route| route.broadcast_text(&text))
            .sum();
        Ok(sent)
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let routes = self.routes.read();
        RouterStats {
            routes: routes.len(),
            connections: routes.iter().map(Route::client_count).sum(),
        }
    }

    /// Check whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Shut down every route: stop services and close connections.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for route in self.routes() {
            route.shutdown();
        }
        info!("Router shut down");
    }
}

/// Reduce a request target to the path used for route matching.
///
/// Strips the query and fragment. A target that does not parse is returned
/// unchanged.
#[must_use]
pub fn normalize_path(target: &str) -> Cow<'_, str> {
    let parsed = Url::parse("http://localhost/").and_then(|base| base.join(target));
    match parsed {
        Ok(url) if url.path() == target => Cow::Borrowed(target),
        Ok(url) => Cow::Owned(url.path().to_string()),
        Err(_) => Cow::Borrowed(target),
    }
}

fn default_route() -> Result<Route, RouteError> {
    Route::builder(RouteConfig::new(ROOT_PATH))
        .handler(|| DefaultHandler)
        .build()
}
