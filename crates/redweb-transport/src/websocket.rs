//! WebSocket connection pump.
//!
//! Bridges an upgraded tokio-tungstenite stream and a route: one writer task
//! drains the connection's outbound queue into the socket while the calling
//! task reads frames and hands them to the route in order.

use futures_util::{SinkExt, StreamExt};
use redweb_core::{CloseReason, Outbound, Route};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// Register an upgraded stream with `route` and pump frames until either side
/// closes it.
pub async fn serve_connection<S>(route: Route, ws: WebSocketStream<S>, remote_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = route.accept(remote_addr, tx);

    let writer_id = conn.id();
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(connection = %writer_id, error = %e, "Write failed");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            () = conn.closed() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => route.handle_frame(&conn, text.as_bytes()),
                Some(Ok(Message::Binary(data))) => route.handle_frame(&conn, &data),
                Some(Ok(Message::Close(_))) | None => {
                    route.disconnect(&conn, CloseReason::ClientClosed);
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite.
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    route.disconnect(&conn, CloseReason::ClientClosed);
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection = %conn.id(), error = %e, "WebSocket error");
                    route.disconnect(&conn, CloseReason::Transport);
                    break;
                }
            },
        }
    }

    if writer.await.is_err() {
        warn!(connection = %conn.id(), "Writer task failed");
    }
    trace!(connection = %conn.id(), path = %route.path(), "Connection finished");
}
