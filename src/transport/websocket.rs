//! WebSocket transport.
//!
//! Same session model as the socket transport, framed over an upgraded
//! HTTP connection. The configured address is a URL: its host is the
//! bind/dial address and its path the HTTP route for the upgrade.
//! Binary WebSocket messages are adapted into a byte stream and handed
//! to the multiplexer.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, warn};

use crate::codec::PayloadCodec;
use crate::error::{Error, Result};
use crate::method::Method;
use crate::transport::mux::MuxSession;
use crate::transport::{
    BoxedIo, Call, MethodHandler, Transport, TransportCore, TransportOptions,
};

/// Transport over WebSocket connections.
pub struct WebSocketTransport {
    core: Arc<TransportCore>,
    session: Mutex<Option<Arc<MuxSession>>>,
    shutdown: Notify,
}

impl WebSocketTransport {
    /// Create a WebSocket transport. The address must be a
    /// `ws://host:port/path` URL.
    pub fn new(options: TransportOptions) -> Result<Self> {
        Ok(Self {
            core: Arc::new(TransportCore::new(options, PayloadCodec::Json)?),
            session: Mutex::new(None),
            shutdown: Notify::new(),
        })
    }

    async fn ensure_connected(&self) -> Result<Arc<MuxSession>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.is_closed() {
                return Ok(Arc::clone(session));
            }
        }

        let options = &self.core.options;
        let mut request = options
            .first_addr()?
            .into_client_request()
            .map_err(|e| Error::Config(e.to_string()))?;
        if let Some(origin) = options.origin.as_deref() {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| Error::Config(format!("invalid origin: {e}")))?;
            request.headers_mut().insert("Origin", value);
        }

        let (ws, _response) = timeout(options.connect_timeout, connect_async(request))
            .await?
            .map_err(ws_err)?;

        let io: BoxedIo = Box::new(WsByteStream::new(ws));
        let session = Arc::new(MuxSession::client(io));
        self.core.spawn_acceptor(Arc::clone(&session));
        self.core.fire_connected();

        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Upgrade an accepted connection off the accept loop and start
    /// its server session.
    fn spawn_upgrade<S>(core: Arc<TransportCore>, stream: S, path: Arc<String>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let check_path = move |request: &Request, response: Response| {
                if request.uri().path() == path.as_str() {
                    Ok(response)
                } else {
                    let mut not_found = ErrorResponse::new(Some("not found".to_string()));
                    *not_found.status_mut() = StatusCode::NOT_FOUND;
                    Err(not_found)
                }
            };

            match accept_hdr_async(stream, check_path).await {
                Ok(ws) => core.start_server_session(Box::new(WsByteStream::new(ws))),
                Err(e) => warn!("websocket upgrade failed: {e}"),
            }
        });
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn invoke(&self, method: &Method) -> Result<Arc<dyn Call>> {
        if method.is_pubsub() {
            return Err(Error::Unsupported);
        }
        let session = self.ensure_connected().await?;
        self.core.invoke_on(&session, method).await
    }

    fn register_handler(&self, method: Method, handler: MethodHandler) {
        self.core.registry.register(method, handler);
    }

    fn unregister_handler(&self, method: &Method) {
        self.core.registry.unregister(method);
    }

    async fn dial(&self) -> Result<()> {
        if self.session.lock().await.is_some() {
            return Err(Error::Config("transport is already connected".into()));
        }
        self.ensure_connected().await.map(|_| ())
    }

    async fn serve(&self) -> Result<()> {
        let (host, path) = parse_ws_url(self.core.options.first_addr()?)?;
        let path = Arc::new(path);
        let listener = TcpListener::bind(&host).await?;
        let tls = self
            .core
            .options
            .tls
            .as_ref()
            .map(|tls| TlsAcceptor::from(Arc::clone(&tls.server)));

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shutdown.notified() => return Ok(()),
            };
            debug!("accepted websocket connection from {peer}");

            match tls.as_ref() {
                Some(acceptor) => {
                    let core = Arc::clone(&self.core);
                    let acceptor = acceptor.clone();
                    let path = Arc::clone(&path);
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(stream) => Self::spawn_upgrade(core, stream, path),
                            Err(e) => warn!("TLS handshake with {peer} failed: {e}"),
                        }
                    });
                }
                None => Self::spawn_upgrade(Arc::clone(&self.core), stream, Arc::clone(&path)),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
        Ok(())
    }

    fn codec(&self) -> PayloadCodec {
        self.core.codec
    }
}

/// Split a `ws://host:port/path` address into bind host and route.
fn parse_ws_url(addr: &str) -> Result<(String, String)> {
    let rest = addr
        .strip_prefix("ws://")
        .or_else(|| addr.strip_prefix("wss://"))
        .ok_or_else(|| Error::Config(format!("not a websocket URL: {addr}")))?;

    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if host.is_empty() {
        return Err(Error::Config(format!("missing host in URL: {addr}")));
    }
    Ok((host.to_string(), path.to_string()))
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> Error {
    to_io(e).into()
}

fn to_io(e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    match e {
        tokio_tungstenite::tungstenite::Error::Io(e) => e,
        other => std::io::Error::other(other),
    }
}

/// Adapts a WebSocket connection into a byte stream.
///
/// Each write becomes one binary message; reads drain received binary
/// messages. Control messages (ping/pong) are handled by the
/// underlying stack; text messages are ignored.
struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
}

impl<S> WsByteStream<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buf = Bytes::from(data);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                // Pings are answered by the stack; nothing else carries
                // stream bytes.
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(to_io(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut self.inner)
                    .start_send(Message::Binary(buf.to_vec()))
                    .map_err(to_io)?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(to_io(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_io)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(to_io)
    }
}
