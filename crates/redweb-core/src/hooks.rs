//! Connection lifecycle hooks.

use crate::connection::{CloseReason, Connection};
use crate::route::DispatchError;

/// Callbacks fired by a route over the lifetime of its connections.
///
/// All methods default to no-ops. They run synchronously on the task that
/// triggered them and must not block.
pub trait RouteHooks: Send + Sync + 'static {
    /// A connection was accepted and registered.
    fn on_open(&self, _conn: &Connection) {}

    /// A connection was closed and deregistered. Fires exactly once.
    fn on_close(&self, _conn: &Connection, _reason: CloseReason) {}

    /// A connection is about to be superseded by a newer one with its key.
    fn on_evict(&self, _conn: &Connection) {}

    /// A frame is being handed to `handler`.
    fn on_dispatch(&self, _conn: &Connection, _handler: &str) {}

    /// A frame was rejected or a handler failed.
    fn on_error(&self, _conn: &Connection, _error: &DispatchError) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl RouteHooks for NoopHooks {}
