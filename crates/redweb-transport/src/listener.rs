//! TCP listener that feeds upgrade requests to a router.

use crate::error::TransportError;
use crate::upgrade::handle_upgrade;
use redweb_core::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Maximum size of the HTTP request head in bytes.
    pub max_head_size: usize,
    /// Time allowed for the peer to send its request head.
    pub handshake_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_message_size: 64 * 1024, // 64 KB
            max_head_size: 8 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Requests a listener to stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the listener to shut down its router and stop accepting.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Accepts TCP connections and upgrades them through a [`Router`].
pub struct WebSocketListener {
    listener: TcpListener,
    router: Arc<Router>,
    config: Arc<ListenerConfig>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl WebSocketListener {
    /// Bind to `config.bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(config: ListenerConfig, router: Arc<Router>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("WebSocket listener bound to {}", listener.local_addr()?);

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            router,
            config: Arc::new(config),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Get the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Get a handle that stops [`run`](Self::run).
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Accept connections until shut down.
    ///
    /// On shutdown every route is shut down before the socket is released.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and skipped.
    pub async fn run(self) -> Result<(), TransportError> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    debug!(remote = %remote_addr, "Accepted TCP connection");

                    let router = Arc::clone(&self.router);
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        match handle_upgrade(&router, stream, remote_addr, &config).await {
                            Ok(()) => {}
                            Err(e) if e.is_benign() => {
                                debug!(remote = %remote_addr, error = %e, "Upgrade abandoned");
                            }
                            Err(e) => {
                                warn!(remote = %remote_addr, error = %e, "Upgrade failed");
                            }
                        }
                    });
                }
            }
        }

        self.router.shutdown();
        info!("WebSocket listener stopped");
        Ok(())
    }
}
