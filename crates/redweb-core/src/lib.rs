//! # redweb-core
//!
//! Routing and dispatch for RedWeb socket servers.
//!
//! - **Router** - Matches upgrade request paths to routes
//! - **Route** - Owns a path, its handlers and its live connections
//! - **Handler** - Named message-processing logic
//! - **Service** - Background logic with an optional tick
//! - **Registry** - Identity-keyed container with change observers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Router    │────▶│    Route    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                           │         │
//!                                           ▼         ▼
//!                                    ┌──────────┐ ┌──────────┐
//!                                    │ Handlers │ │ Services │
//!                                    └──────────┘ └──────────┘
//! ```
//!
//! The transport hands every upgraded socket to [`Route::accept`] together
//! with an outbound queue, then feeds inbound frames to
//! [`Route::handle_frame`] one at a time.

pub mod connection;
pub mod handler;
pub mod hooks;
pub mod registry;
pub mod route;
pub mod router;
pub mod service;

pub use connection::{CloseReason, Connection, ConnectionError, ConnectionId, Outbound};
pub use handler::{
    handler_factory, DefaultHandler, Handler, HandlerCatalog, HandlerError, HandlerFactory,
};
pub use hooks::{NoopHooks, RouteHooks};
pub use registry::{Registry, RegistryEvent, RegistryItem};
pub use route::{DispatchError, DispatchPolicy, Route, RouteBuilder, RouteConfig, RouteError};
pub use router::{normalize_path, Router, RouterError, RouterStats, ROOT_PATH};
pub use service::Service;
