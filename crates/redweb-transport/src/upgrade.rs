//! HTTP upgrade handling.
//!
//! The request head is buffered and parsed before anything is written, so a
//! request with no matching route can be dropped without a single byte going
//! back to the peer.

use crate::error::TransportError;
use crate::listener::ListenerConfig;
use crate::websocket::serve_connection;
use httparse::{ParserConfig, Status};
use redweb_core::Router;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::create_response;
use tokio_tungstenite::tungstenite::http::{Request, Response, Uri, Version};
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

const MAX_HEADERS: usize = 64;
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// A parsed upgrade request.
#[derive(Debug)]
pub struct UpgradeRequest {
    target: String,
    request: Request<()>,
    head: Vec<u8>,
}

impl UpgradeRequest {
    /// Parse the bytes buffered so far.
    ///
    /// Returns `Ok(None)` while the head is incomplete. Bytes after the head
    /// belong to the WebSocket stream and are kept. A request target that is
    /// not a valid URI is kept verbatim for routing.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MalformedRequest`] if the bytes are not an
    /// HTTP/1.x request head.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, TransportError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let mut parser = ParserConfig::default();
        parser.allow_multiple_spaces_in_request_line_delimiters(true);

        let len = match parser.parse_request(&mut parsed, buf) {
            Ok(Status::Complete(len)) => len,
            Ok(Status::Partial) => return Ok(None),
            Err(e) => return Err(TransportError::MalformedRequest(e.to_string())),
        };

        let (Some(method), Some(target), Some(version)) =
            (parsed.method, parsed.path, parsed.version)
        else {
            return Err(TransportError::MalformedRequest(
                "incomplete request line".into(),
            ));
        };
        let version = match version {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let uri = target
            .parse::<Uri>()
            .unwrap_or_else(|_| Uri::from_static("/"));
        let mut builder = Request::builder().method(method).uri(uri).version(version);
        for header in parsed.headers.iter() {
            builder = builder.header(header.name, header.value);
        }

        let request = builder
            .body(())
            .map_err(|e| TransportError::MalformedRequest(e.to_string()))?;

        Ok(Some(Self {
            target: target.to_string(),
            request,
            head: buf[len..].to_vec(),
        }))
    }

    /// Get the raw request target, e.g. `/chat?room=1`.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get the parsed request.
    #[must_use]
    pub fn request(&self) -> &Request<()> {
        &self.request
    }
}

/// Read an upgrade request head from a fresh stream.
///
/// # Errors
///
/// Fails if the peer closes the stream, exceeds the head size limit, does not
/// finish within the handshake timeout or sends an unparseable head.
pub async fn read_request<S>(
    stream: &mut S,
    config: &ListenerConfig,
) -> Result<UpgradeRequest, TransportError>
where
    S: AsyncRead + Unpin,
{
    timeout(
        config.handshake_timeout,
        read_head(stream, config.max_head_size),
    )
    .await
    .map_err(|_| TransportError::Timeout)?
}

async fn read_head<S>(stream: &mut S, max: usize) -> Result<UpgradeRequest, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(request) = UpgradeRequest::parse(&buf)? {
            if buf.len() - request.head.len() > max {
                return Err(TransportError::HeadTooLarge(max));
            }
            return Ok(request);
        }
        if buf.len() > max {
            return Err(TransportError::HeadTooLarge(max));
        }
    }
}

/// Read an upgrade request from `stream`, route it and serve the resulting
/// connection until it closes.
///
/// Generic over the byte stream so a TLS stream can be passed in.
///
/// # Errors
///
/// Returns [`TransportError::NoRoute`] after dropping the stream untouched if
/// no route matches, or a handshake error if the request is not a valid
/// WebSocket upgrade.
pub async fn handle_upgrade<S>(
    router: &Router,
    mut stream: S,
    remote_addr: SocketAddr,
    config: &ListenerConfig,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = read_request(&mut stream, config).await?;
    upgrade(router, request, stream, remote_addr, config).await
}

/// Complete the upgrade for an already parsed request.
///
/// # Errors
///
/// See [`handle_upgrade`].
pub async fn upgrade<S>(
    router: &Router,
    request: UpgradeRequest,
    mut stream: S,
    remote_addr: SocketAddr,
    config: &ListenerConfig,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(route) = router.resolve(request.target()) else {
        debug!(remote = %remote_addr, target = %request.target(), "Dropping unroutable upgrade");
        drop(stream);
        return Err(TransportError::NoRoute(request.target));
    };

    let response = match create_response(request.request()) {
        Ok(response) => response,
        Err(e) => {
            warn!(remote = %remote_addr, error = %e, "Rejecting invalid upgrade request");
            let _ = stream.write_all(BAD_REQUEST).await;
            let _ = stream.shutdown().await;
            return Err(TransportError::Handshake(e.to_string()));
        }
    };

    stream.write_all(&encode_response(&response)).await?;
    stream.flush().await?;
    trace!(remote = %remote_addr, path = %route.path(), "Upgrade response sent");

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    let ws =
        WebSocketStream::from_partially_read(stream, request.head, Role::Server, Some(ws_config))
            .await;

    serve_connection(route, ws, remote_addr).await;
    Ok(())
}

fn encode_response(response: &Response<()>) -> Vec<u8> {
    let mut out = format!("{:?} {}\r\n", response.version(), response.status()).into_bytes();
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}
