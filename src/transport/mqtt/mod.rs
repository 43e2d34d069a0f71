//! MQTT broker transport.
//!
//! Emulates per-call connections on a topic-routing broker. Clients
//! publish an INVOKE frame to a per-call control topic and wait for the
//! server's ACK; servers hold one shared-group subscription per
//! registered method, so the broker load-balances invocations across
//! replicas subscribing with the same group.
//!
//! # Example
//!
//! ```no_run
//! use wirecall::transport::mqtt::MqttTransport;
//! use wirecall::transport::TransportOptions;
//!
//! let transport = MqttTransport::new(
//!     TransportOptions::new().address("mqtt://localhost:1883"),
//! );
//! ```

mod broker;
mod call;
mod memory;
mod pubsub;

pub use broker::{BrokerClient, BrokerQos, RumqttcBroker, SubscriptionHandler};
pub use memory::MemoryBroker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::PayloadCodec;
use crate::error::{Error, Result};
use crate::message::WireMessage;
use crate::method::Method;
use crate::transport::{
    panic_text, Call, HandlerRegistry, MethodHandler, Transport, TransportOptions,
};

use self::call::{topics, MqttCall};
use self::pubsub::PubSubCall;

/// Transport over an MQTT broker.
pub struct MqttTransport {
    client: Arc<dyn BrokerClient>,
    registry: Arc<HandlerRegistry>,
    options: TransportOptions,
    codec: PayloadCodec,
    connected: AtomicBool,
    /// Methods whose shared control subscription is installed.
    subscribed: Mutex<Vec<Method>>,
    shutdown: Notify,
}

impl MqttTransport {
    /// Create a transport connected to a real broker at the configured
    /// address.
    pub fn new(options: TransportOptions) -> Result<Self> {
        let addr = options.first_addr()?.to_string();
        let client = Arc::new(RumqttcBroker::new(addr, options.connect_timeout));
        Self::build(options, client)
    }

    /// Create a transport over a caller-supplied broker client, e.g. a
    /// [`MemoryBroker`] handle.
    pub fn with_client(options: TransportOptions, client: Arc<dyn BrokerClient>) -> Result<Self> {
        options.first_addr()?;
        Self::build(options, client)
    }

    fn build(options: TransportOptions, client: Arc<dyn BrokerClient>) -> Result<Self> {
        let codec = options.codec.unwrap_or(PayloadCodec::Json);
        Ok(Self {
            client,
            registry: Arc::new(HandlerRegistry::new()),
            options,
            codec,
            connected: AtomicBool::new(false),
            subscribed: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.client.connect().await?;
        self.connected.store(true, Ordering::Release);
        self.install_subscriptions().await?;
        self.options.events.fire();
        Ok(())
    }

    /// Add the shared-group control subscription for every registered
    /// method that does not have one yet.
    async fn install_subscriptions(&self) -> Result<()> {
        let mut installed = self.subscribed.lock().await;
        for method in self.registry.methods() {
            if installed.contains(&method) || method.is_pubsub() {
                continue;
            }
            self.subscribe_method(&method).await?;
            installed.push(method);
        }
        Ok(())
    }

    async fn subscribe_method(&self, method: &Method) -> Result<()> {
        let filter = topics::shared_control(method, "+");
        let handler = invoke_handler(
            Arc::clone(&self.client),
            Arc::clone(&self.registry),
            self.codec,
            self.options.call_timeout,
        );
        self.client
            .subscribe(&filter, BrokerQos::ExactlyOnce, handler)
            .await
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn invoke(&self, method: &Method) -> Result<Arc<dyn Call>> {
        self.ensure_connected().await?;

        if method.is_pubsub() {
            let call = PubSubCall::connect(Arc::clone(&self.client), self.codec, method).await?;
            return Ok(call);
        }

        let id = Uuid::new_v4().to_string();
        let call =
            MqttCall::connect(Arc::clone(&self.client), self.codec, method, &id, false).await?;
        if let Err(e) = call.invoke().await {
            let _ = call.close().await;
            return Err(e);
        }
        Ok(call)
    }

    fn register_handler(&self, method: Method, handler: MethodHandler) {
        self.registry.register(method, handler);
    }

    fn unregister_handler(&self, method: &Method) {
        self.registry.unregister(method);
    }

    async fn dial(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            return Err(Error::Config("transport is already connected".into()));
        }
        self.ensure_connected().await
    }

    /// Connect, install the shared subscriptions for all registered
    /// methods, and park until the transport is closed; dispatch runs
    /// on the broker client's delivery tasks.
    async fn serve(&self) -> Result<()> {
        self.ensure_connected().await?;
        self.shutdown.notified().await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        self.connected.store(false, Ordering::Release);
        self.client.disconnect().await
    }

    fn codec(&self) -> PayloadCodec {
        self.codec
    }
}

/// Handler for the shared control subscription of one method: decode
/// the INVOKE, build the server-side call, ACK it, and run the
/// registered handler under the per-call timeout.
fn invoke_handler(
    client: Arc<dyn BrokerClient>,
    registry: Arc<HandlerRegistry>,
    codec: PayloadCodec,
    call_timeout: std::time::Duration,
) -> SubscriptionHandler {
    Arc::new(move |topic: &str, payload: Bytes| {
        let client = Arc::clone(&client);
        let registry = Arc::clone(&registry);
        let id = topics::extract_id(topic).to_string();

        let msg: Option<WireMessage> = codec.unmarshal(&payload).ok();
        Box::pin(async move {
            let Some(msg) = msg else {
                warn!("undecodable invoke frame dropped");
                return;
            };
            if !msg.is_invoke() {
                return;
            }
            let Some(method) = msg.method() else {
                warn!("invoke frame with invalid method dropped");
                return;
            };
            let Some(handler) = registry.get(&method) else {
                debug!("no handler registered for {method}");
                return;
            };

            // Run the call on its own task: the delivery path must not
            // block on the handler.
            tokio::spawn(serve_call(client, codec, method, id, handler, call_timeout));
        })
    })
}

async fn serve_call(
    client: Arc<dyn BrokerClient>,
    codec: PayloadCodec,
    method: Method,
    id: String,
    handler: MethodHandler,
    call_timeout: std::time::Duration,
) {
    let call = match MqttCall::connect(client, codec, &method, &id, true).await {
        Ok(call) => call,
        Err(e) => {
            warn!("failed to set up call {id} for {method}: {e}");
            return;
        }
    };

    if let Err(e) = call.send_control(WireMessage::ack()).await {
        warn!("failed to ack call {id}: {e}");
        let _ = call.close().await;
        return;
    }

    let fut = handler(Arc::clone(&call) as Arc<dyn Call>);
    let outcome = timeout(call_timeout, std::panic::AssertUnwindSafe(fut).catch_unwind()).await;

    match outcome {
        Err(_elapsed) => {
            let _ = call
                .send_control(WireMessage::error(&Error::DeadlineExceeded))
                .await;
        }
        Ok(Err(panic)) => {
            error!("recovered handler panic: {}", panic_text(&panic));
            let _ = call
                .send_control(WireMessage::error_text("internal handler error"))
                .await;
        }
        Ok(Ok(Err(e))) => {
            let _ = call.send_control(WireMessage::error(&e)).await;
        }
        Ok(Ok(Ok(()))) => {
            let _ = call.send_control(WireMessage::close()).await;
        }
    }

    let _ = call.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Shape;

    #[test]
    fn test_construction_requires_address() {
        assert!(matches!(
            MqttTransport::new(TransportOptions::new()),
            Err(Error::NoAddress)
        ));
    }

    #[test]
    fn test_default_codec_is_json() {
        let hub = Arc::new(MemoryBroker::new());
        let t = MqttTransport::with_client(TransportOptions::new().address("memory"), hub.client())
            .unwrap();
        assert_eq!(t.codec(), PayloadCodec::Json);
    }

    #[tokio::test]
    async fn test_invoke_with_no_server_times_out() {
        let hub = Arc::new(MemoryBroker::new());
        let t = MqttTransport::with_client(TransportOptions::new().address("memory"), hub.client())
            .unwrap();

        // Nobody acks: the handshake blocks until the caller's deadline.
        let r = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            t.invoke(&Method::new("svc/ghost", Shape::Unary)),
        )
        .await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn test_dial_twice_errors() {
        let hub = Arc::new(MemoryBroker::new());
        let t = MqttTransport::with_client(TransportOptions::new().address("memory"), hub.client())
            .unwrap();
        t.dial().await.unwrap();
        assert!(t.dial().await.is_err());
    }
}
