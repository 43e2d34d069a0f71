//! Socket transport: TCP or Unix domain sockets.
//!
//! One multiplexed session per physical link. The client dials lazily
//! on the first invoke; the server accepts connections and runs one
//! session acceptor per link. Both sides run the acceptor, so either
//! peer may originate calls once a session exists.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::transport::{SocketTransport, Transport, TransportOptions};
//! use wirecall::method::{Method, Shape};
//!
//! # async fn run() -> wirecall::Result<()> {
//! let transport = SocketTransport::new(
//!     TransportOptions::new().address("127.0.0.1:7010"),
//! )?;
//! let call = transport.invoke(&Method::new("svc/echo", Shape::Unary)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::codec::PayloadCodec;
use crate::error::{Error, Result};
use crate::method::Method;
use crate::transport::mux::MuxSession;
use crate::transport::options::Protocol;
use crate::transport::{
    BoxedIo, Call, MethodHandler, Transport, TransportCore, TransportOptions,
};

/// Transport over TCP or Unix stream sockets.
pub struct SocketTransport {
    core: Arc<TransportCore>,
    session: Mutex<Option<Arc<MuxSession>>>,
    shutdown: Notify,
}

impl SocketTransport {
    /// Create a socket transport. Fails with `NoAddress` if no address
    /// was configured.
    pub fn new(options: TransportOptions) -> Result<Self> {
        Ok(Self {
            core: Arc::new(TransportCore::new(options, PayloadCodec::MsgPack)?),
            session: Mutex::new(None),
            shutdown: Notify::new(),
        })
    }

    /// Dial and establish the client-side session, reusing a live one.
    async fn ensure_connected(&self) -> Result<Arc<MuxSession>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.is_closed() {
                return Ok(Arc::clone(session));
            }
        }

        let io = self.dial_io().await?;
        let session = Arc::new(MuxSession::client(io));
        // Reverse-direction acceptor: the peer may call back over the
        // same session.
        self.core.spawn_acceptor(Arc::clone(&session));
        self.core.fire_connected();

        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn dial_io(&self) -> Result<BoxedIo> {
        let options = &self.core.options;
        let addr = options.first_addr()?.to_string();

        match options.protocol {
            Protocol::Tcp => {
                let stream = timeout(options.connect_timeout, TcpStream::connect(&addr)).await??;
                stream.set_nodelay(true)?;

                match options.tls.as_ref() {
                    Some(tls) => {
                        let connector = TlsConnector::from(Arc::clone(&tls.client));
                        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&addr);
                        let server_name = rustls::pki_types::ServerName::try_from(host)
                            .map_err(|e| Error::Tls(e.to_string()))?
                            .to_owned();
                        let stream = connector.connect(server_name, stream).await?;
                        Ok(Box::new(stream))
                    }
                    None => Ok(Box::new(stream)),
                }
            }
            Protocol::Unix => {
                let stream = timeout(options.connect_timeout, UnixStream::connect(&addr)).await??;
                Ok(Box::new(stream))
            }
        }
    }

    async fn serve_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
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
            debug!("accepted connection from {peer}");

            if let Err(e) = stream.set_nodelay(true) {
                warn!("set_nodelay failed for {peer}: {e}");
            }

            // Handshake off the accept loop; a slow peer must not stall
            // other connections.
            let core = Arc::clone(&self.core);
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => core.start_server_session(Box::new(stream)),
                        Err(e) => warn!("TLS handshake with {peer} failed: {e}"),
                    },
                    None => core.start_server_session(Box::new(stream)),
                }
            });
        }
    }

    async fn serve_unix(&self, path: &str) -> Result<()> {
        // Remove a stale socket file from a previous run.
        if std::path::Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shutdown.notified() => return Ok(()),
            };
            self.core.start_server_session(Box::new(stream));
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
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
        let addr = self.core.options.first_addr()?.to_string();
        match self.core.options.protocol {
            Protocol::Tcp => self.serve_tcp(&addr).await,
            Protocol::Unix => self.serve_unix(&addr).await,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_requires_address() {
        let r = SocketTransport::new(TransportOptions::new());
        assert!(matches!(r, Err(Error::NoAddress)));
    }

    #[test]
    fn test_default_codec_is_msgpack() {
        let t = SocketTransport::new(TransportOptions::new().address("127.0.0.1:0")).unwrap();
        assert_eq!(t.codec(), PayloadCodec::MsgPack);
    }

    #[tokio::test]
    async fn test_invoke_rejects_pubsub_methods() {
        use crate::method::Shape;
        let t = SocketTransport::new(TransportOptions::new().address("127.0.0.1:0")).unwrap();
        let r = t.invoke(&Method::new("topic/events", Shape::Publisher)).await;
        assert!(matches!(r, Err(Error::Unsupported)));
    }

    #[tokio::test]
    async fn test_invoke_surfaces_dial_failure() {
        // A port nobody listens on: connection refused reaches the
        // caller as a carrier error.
        let t = SocketTransport::new(
            TransportOptions::new()
                .address("127.0.0.1:1")
                .connect_timeout(std::time::Duration::from_secs(1)),
        )
        .unwrap();
        let r = t.invoke(&Method::new("svc/echo", crate::method::Shape::Unary)).await;
        assert!(r.is_err());
    }
}
