//! Router assembly and the listener lifecycle.

use crate::config::{Config, RouteSpec};
use crate::handlers;
use crate::metrics::{self, ServerHooks};
use crate::services;
use anyhow::{Context, Result};
use redweb_core::{HandlerCatalog, Route, Router};
use redweb_transport::WebSocketListener;
use std::sync::Arc;
use tracing::{error, info};

/// Build a route from its config entry.
///
/// # Errors
///
/// Returns an error for unknown handler or service names or an invalid route.
pub fn build_route(spec: &RouteSpec, catalog: &HandlerCatalog) -> Result<Route> {
    let factories = catalog
        .resolve(&spec.handlers)
        .with_context(|| format!("Invalid handlers for route {}", spec.path))?;

    let mut builder = Route::builder(spec.route_config())
        .handler_factories(factories)
        .hooks(Arc::new(ServerHooks));
    for service in &spec.services {
        builder = builder.shared_service(services::build(service)?);
    }

    builder
        .build()
        .with_context(|| format!("Invalid route {}", spec.path))
}

/// Build the router described by the config.
///
/// # Errors
///
/// Returns an error if any route is invalid or two routes share a path.
pub fn build_router(config: &Config, catalog: &HandlerCatalog) -> Result<Router> {
    let root;
    let specs = if config.routes.is_empty() {
        root = [RouteSpec::root()];
        &root[..]
    } else {
        &config.routes[..]
    };

    let routes = specs
        .iter()
        .map(|spec| build_route(spec, catalog))
        .collect::<Result<Vec<_>>>()?;

    Ok(Router::new(routes)?)
}

/// Run the WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the router cannot be built or the listener fails.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let router = Arc::new(build_router(&config, &handlers::catalog())?);
    for route in router.routes() {
        info!(path = %route.path(), handlers = ?route.handler_names(), "Route ready");
    }

    let listener = WebSocketListener::bind(config.listener()?, Arc::clone(&router))
        .await
        .context("Failed to bind listener")?;
    info!("RedWeb server listening on ws://{}", listener.local_addr()?);

    let shutdown = listener.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.shutdown();
        }
    });

    listener.run().await?;
    Ok(())
}
