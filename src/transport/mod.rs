//! Transports: the binding between a physical carrier and RPC calls.
//!
//! A [`Transport`] owns its underlying link (socket session or broker
//! connection) and a registry of method handlers. Client code asks it
//! to [`invoke`](Transport::invoke) a method, which yields a
//! [`Call`] — the logical full-duplex channel for that single
//! invocation. Server code registers handlers and runs
//! [`serve`](Transport::serve).
//!
//! Implementations:
//!
//! - [`tcp::SocketTransport`] — TCP or Unix sockets, one multiplexed
//!   session per link
//! - [`websocket::WebSocketTransport`] — the same model over an
//!   upgraded HTTP connection
//! - [`mqtt::MqttTransport`] — per-call connections emulated on an
//!   MQTT broker, with shared-group server load balancing

pub mod events;
pub mod mqtt;
pub mod options;
pub mod tcp;
pub mod websocket;

pub(crate) mod conn;
pub(crate) mod mux;

pub use events::{ConnectCallback, ConnectEvents};
pub use mqtt::MqttTransport;
pub use options::{Protocol, TransportOptions};
pub use tcp::SocketTransport;
pub use websocket::WebSocketTransport;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

use crate::codec::PayloadCodec;
use crate::error::Result;
use crate::message::WireMessage;
use crate::method::Method;

use self::conn::StreamCall;
use self::mux::MuxSession;

/// Boxed future returned by handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered server-side handler for one method.
///
/// The handler receives the call connection of the invocation and runs
/// until the call is finished. Returning an error sends an ERROR frame
/// to the peer; returning `Ok` sends CLOSE.
pub type MethodHandler = Arc<dyn Fn(Arc<dyn Call>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One logical full-duplex channel carrying the frames of a single
/// invocation.
///
/// All operations are cancel-safe: dropping a pending future aborts
/// only that operation and loses no frames. Once a fatal condition is
/// observed (carrier error, remote ERROR frame, local close) the call
/// latches it and every subsequent operation returns that same error.
#[async_trait]
pub trait Call: Send + Sync {
    /// Send one DATA frame carrying `data`.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Receive the next DATA payload.
    ///
    /// Returns `Ok(None)` at end of stream: the peer sent CLOSE or the
    /// carrier reached EOF. Receiving CLOSE ends the receive direction
    /// only; sending may continue.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Send a CLOSE frame, signalling end of stream to the peer.
    async fn send_close(&self) -> Result<()>;

    /// Tear down the call and release its carrier resources.
    ///
    /// Idempotent; subsequent `send`/`recv` return an error.
    async fn close(&self) -> Result<()>;

    /// The payload codec bound to this call.
    fn codec(&self) -> PayloadCodec;
}

/// A communication transport for RPC calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new call for the given method.
    ///
    /// Dials lazily: calling [`dial`](Transport::dial) first is not
    /// required.
    async fn invoke(&self, method: &Method) -> Result<Arc<dyn Call>>;

    /// Register a handler for the given method, replacing any previous
    /// registration.
    fn register_handler(&self, method: Method, handler: MethodHandler);

    /// Remove the handler for the given method.
    fn unregister_handler(&self, method: &Method);

    /// Establish the connection eagerly.
    ///
    /// Returns an error if the transport is already connected.
    async fn dial(&self) -> Result<()>;

    /// Accept incoming calls and dispatch them to registered handlers.
    ///
    /// Runs until the transport is closed or the listener fails.
    async fn serve(&self) -> Result<()>;

    /// Close the transport; blocked operations unblock with errors.
    async fn close(&self) -> Result<()>;

    /// The payload codec used on this transport.
    fn codec(&self) -> PayloadCodec;
}

/// Byte stream with the bounds every carrier must satisfy.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Boxed carrier handed to the multiplexer.
pub(crate) type BoxedIo = Box<dyn AsyncReadWrite>;

/// Handler registry keyed by method identity.
///
/// Read-mostly: registration normally happens before `serve()` or the
/// first invoke, but the lock admits late registration as well.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    map: RwLock<HashMap<Method, MethodHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, method: Method, handler: MethodHandler) {
        self.map.write().unwrap().insert(method, handler);
    }

    pub(crate) fn unregister(&self, method: &Method) {
        self.map.write().unwrap().remove(method);
    }

    pub(crate) fn get(&self, method: &Method) -> Option<MethodHandler> {
        self.map.read().unwrap().get(method).cloned()
    }

    pub(crate) fn methods(&self) -> Vec<Method> {
        self.map.read().unwrap().keys().cloned().collect()
    }
}

/// State shared by the session-multiplexing transports: the handler
/// registry, the options, and the accept/invoke machinery over a
/// multiplexer session.
pub(crate) struct TransportCore {
    pub(crate) registry: HandlerRegistry,
    pub(crate) options: TransportOptions,
    pub(crate) codec: PayloadCodec,
}

impl TransportCore {
    pub(crate) fn new(options: TransportOptions, default_codec: PayloadCodec) -> Result<Self> {
        options.first_addr()?;
        let codec = options.codec.unwrap_or(default_codec);
        Ok(Self {
            registry: HandlerRegistry::new(),
            options,
            codec,
        })
    }

    pub(crate) fn fire_connected(&self) {
        self.options.events.fire();
    }

    /// Open a sub-stream on the session, wrap it into a call and send
    /// the INVOKE frame.
    pub(crate) async fn invoke_on(
        &self,
        session: &MuxSession,
        method: &Method,
    ) -> Result<Arc<dyn Call>> {
        let sub = session.open().await?;
        let call = StreamCall::spawn(sub, self.codec);
        if let Err(e) = call.send_control(WireMessage::invoke(method)).await {
            let _ = call.close().await;
            return Err(e);
        }
        Ok(call)
    }

    /// Start a server-role session on an accepted byte stream and fire
    /// the connect callbacks.
    pub(crate) fn start_server_session(self: &Arc<Self>, io: BoxedIo) {
        let session = Arc::new(MuxSession::server(io));
        self.spawn_acceptor(Arc::clone(&session));
        self.fire_connected();
    }

    /// Accept sub-streams on the session and dispatch each to its
    /// registered handler until the session ends.
    ///
    /// Runs in its own task so either peer may originate calls on the
    /// same session.
    pub(crate) fn spawn_acceptor(self: &Arc<Self>, session: Arc<MuxSession>) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let sub = match session.accept().await {
                    Ok(sub) => sub,
                    Err(e) => {
                        debug!("session acceptor finished: {e}");
                        break;
                    }
                };

                let core = Arc::clone(&core);
                tokio::spawn(async move {
                    core.dispatch_substream(sub).await;
                });
            }
        });
    }

    async fn dispatch_substream(&self, sub: mux::SubStream) {
        let call = StreamCall::spawn(sub, self.codec);

        let method = match call.recv_invoke().await {
            Ok(method) => method,
            Err(e) => {
                warn!("rejecting call: {e}");
                let _ = call.close().await;
                return;
            }
        };

        let Some(handler) = self.registry.get(&method) else {
            warn!("no handler registered for {method}");
            let _ = call.close().await;
            return;
        };

        run_handler(handler, call).await;
    }
}

/// Run a handler on an accepted call: CLOSE on success, ERROR on
/// failure, panic recovered and logged.
pub(crate) async fn run_handler(handler: MethodHandler, call: Arc<StreamCall>) {
    let outcome = std::panic::AssertUnwindSafe(handler(call.clone() as Arc<dyn Call>))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {
            let _ = call.send_control(WireMessage::close()).await;
        }
        Ok(Err(e)) => {
            let _ = call.send_control(WireMessage::error(&e)).await;
        }
        Err(panic) => {
            error!("recovered handler panic: {}", panic_text(&panic));
            let _ = call
                .send_control(WireMessage::error_text("internal handler error"))
                .await;
        }
    }

    let _ = call.close().await;
}

pub(crate) fn panic_text(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::method::Shape;

    fn noop_handler() -> MethodHandler {
        Arc::new(|_call| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_registry_register_get_unregister() {
        let registry = HandlerRegistry::new();
        let method = Method::new("svc/echo", Shape::Unary);

        assert!(registry.get(&method).is_none());
        registry.register(method.clone(), noop_handler());
        assert!(registry.get(&method).is_some());
        assert_eq!(registry.methods(), vec![method.clone()]);

        registry.unregister(&method);
        assert!(registry.get(&method).is_none());
    }

    #[test]
    fn test_registry_replaces_on_reregister() {
        let registry = HandlerRegistry::new();
        let method = Method::new("svc/echo", Shape::Unary);
        registry.register(method.clone(), noop_handler());
        registry.register(method.clone(), noop_handler());
        assert_eq!(registry.methods().len(), 1);
    }

    #[test]
    fn test_core_requires_address() {
        let r = TransportCore::new(TransportOptions::new(), PayloadCodec::MsgPack);
        assert!(matches!(r, Err(Error::NoAddress)));
    }

    #[test]
    fn test_core_codec_override() {
        let core = TransportCore::new(
            TransportOptions::new().address("x").codec(PayloadCodec::Json),
            PayloadCodec::MsgPack,
        )
        .unwrap();
        assert_eq!(core.codec, PayloadCodec::Json);
    }

    #[test]
    fn test_panic_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static panic");
        assert_eq!(panic_text(boxed.as_ref()), "static panic");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_text(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_text(boxed.as_ref()), "unknown panic");
    }
}
