//! Per-call connection emulated on broker topics.
//!
//! A call is identified by a random id `I`; its frames travel on four
//! topics derived from the method `M` and `I`:
//!
//! | purpose | topic |
//! |---|---|
//! | INVOKE fan-out | `MQC/M/Control/I` (servers: `$share/MQC/` prefixed) |
//! | client → server control | `MQC/M/Client/I/Control` |
//! | client → server data | `MQC/M/Client/I/Data` |
//! | server → client control | `MQC/M/Server/I/Control` |
//! | server → client data | `MQC/M/Server/I/Data` |
//!
//! Control frames are published as encoded wire messages at
//! exactly-once; data frames as raw payload bytes at at-most-once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::codec::PayloadCodec;
use crate::error::{Error, Result};
use crate::message::WireMessage;
use crate::method::Method;
use crate::transport::mqtt::broker::{BrokerClient, BrokerQos, SubscriptionHandler};
use crate::transport::Call;

/// Inbound frame queue depth per call.
const INBOUND_QUEUE: usize = 16;

/// Topic name derivation for the broker schema.
pub(crate) mod topics {
    use crate::method::Method;

    /// Invoke fan-out topic published by clients.
    pub(crate) fn control(method: &Method, id: &str) -> String {
        format!("MQC/{method}/Control/{id}")
    }

    /// Load-balanced server group subscription for the invoke topic.
    pub(crate) fn shared_control(method: &Method, id: &str) -> String {
        format!("$share/MQC/MQC/{method}/Control/{id}")
    }

    /// Client-to-server topic; `kind` is `Control` or `Data`.
    pub(crate) fn client(method: &Method, id: &str, kind: &str) -> String {
        format!("MQC/{method}/Client/{id}/{kind}")
    }

    /// Server-to-client topic; `kind` is `Control` or `Data`.
    pub(crate) fn server(method: &Method, id: &str, kind: &str) -> String {
        format!("MQC/{method}/Server/{id}/{kind}")
    }

    /// Shared topic of a pub/sub method.
    pub(crate) fn pubsub(method: &Method) -> String {
        format!("MQC/{}", method.name)
    }

    /// The call id is the final topic level.
    pub(crate) fn extract_id(topic: &str) -> &str {
        topic.rsplit('/').next().unwrap_or_default()
    }
}

/// Call connection over broker topics.
pub(crate) struct MqttCall {
    client: Arc<dyn BrokerClient>,
    codec: PayloadCodec,
    method: Method,
    inbound: Mutex<mpsc::Receiver<WireMessage>>,
    sticky: Arc<StdMutex<Option<Error>>>,
    eof: AtomicBool,
    closed: AtomicBool,
    control_topic: String,
    send_control_topic: String,
    send_data_topic: String,
    recv_control_topic: String,
    recv_data_topic: String,
}

impl MqttCall {
    /// Build a call: subscribe to the two inbound topics of this role.
    pub(crate) async fn connect(
        client: Arc<dyn BrokerClient>,
        codec: PayloadCodec,
        method: &Method,
        id: &str,
        server: bool,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let sticky = Arc::new(StdMutex::new(None));

        let (send_side, recv_side): (fn(&Method, &str, &str) -> String, fn(&Method, &str, &str) -> String) =
            if server {
                (topics::server, topics::client)
            } else {
                (topics::client, topics::server)
            };

        let call = Arc::new(Self {
            client: Arc::clone(&client),
            codec,
            method: method.clone(),
            inbound: Mutex::new(rx),
            sticky: Arc::clone(&sticky),
            eof: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            control_topic: topics::control(method, id),
            send_control_topic: send_side(method, id, "Control"),
            send_data_topic: send_side(method, id, "Data"),
            recv_control_topic: recv_side(method, id, "Control"),
            recv_data_topic: recv_side(method, id, "Data"),
        });

        client
            .subscribe(
                &call.recv_control_topic,
                BrokerQos::ExactlyOnce,
                control_handler(codec, tx.clone(), Arc::clone(&sticky)),
            )
            .await?;
        client
            .subscribe(&call.recv_data_topic, BrokerQos::AtMostOnce, data_handler(tx))
            .await?;

        Ok(call)
    }

    /// Client-side invoke handshake: publish INVOKE, await ACK.
    pub(crate) async fn invoke(&self) -> Result<()> {
        let invoke = WireMessage::invoke(&self.method);
        let payload = self.codec.marshal(&invoke)?;
        self.client
            .publish(
                &self.control_topic,
                BrokerQos::ExactlyOnce,
                false,
                Bytes::from(payload),
            )
            .await?;

        let msg = self
            .next_message()
            .await?
            .ok_or(Error::ConnectionClosed)?;
        if !msg.is_ack() {
            return Err(self.latch(Error::ProtocolViolation));
        }
        Ok(())
    }

    /// Send any control frame as an encoded wire message.
    pub(crate) async fn send_control(&self, msg: WireMessage) -> Result<()> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        let payload = self.codec.marshal(&msg)?;
        self.client
            .publish(
                &self.send_control_topic,
                BrokerQos::ExactlyOnce,
                false,
                Bytes::from(payload),
            )
            .await
    }

    fn sticky_err(&self) -> Option<Error> {
        self.sticky.lock().unwrap().clone()
    }

    fn latch(&self, err: Error) -> Error {
        let mut slot = self.sticky.lock().unwrap();
        slot.get_or_insert(err).clone()
    }

    /// Dequeue the next frame without data-path classification.
    async fn next_message(&self) -> Result<Option<WireMessage>> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        Ok(self.inbound.lock().await.recv().await)
    }
}

#[async_trait]
impl Call for MqttCall {
    async fn send(&self, data: Bytes) -> Result<()> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        // Raw payload bytes: the DATA tag is implied by the topic.
        self.client
            .publish(&self.send_data_topic, BrokerQos::AtMostOnce, false, data)
            .await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        if self.eof.load(Ordering::Acquire) {
            return Ok(None);
        }
        let msg = self.next_message().await?;
        match msg {
            None => match self.sticky_err() {
                Some(e) => Err(e),
                None => {
                    self.eof.store(true, Ordering::Release);
                    Ok(None)
                }
            },
            Some(msg) if msg.is_close() => {
                self.eof.store(true, Ordering::Release);
                Ok(None)
            }
            Some(msg) if msg.is_data() => Ok(Some(msg.data)),
            Some(msg) if msg.is_error() => Err(self.latch(msg.as_error().unwrap_or(Error::InvalidMessage))),
            Some(_) => Err(self.latch(Error::ProtocolViolation)),
        }
    }

    async fn send_close(&self) -> Result<()> {
        self.send_control(WireMessage::close()).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.latch(Error::ConnectionClosed);
        // Tear down by releasing the call's subscription set.
        self.client.unsubscribe(&self.recv_control_topic).await?;
        self.client.unsubscribe(&self.recv_data_topic).await?;
        Ok(())
    }

    fn codec(&self) -> PayloadCodec {
        self.codec
    }
}

/// Handler for a control topic: payloads are encoded wire messages.
fn control_handler(
    codec: PayloadCodec,
    tx: mpsc::Sender<WireMessage>,
    sticky: Arc<StdMutex<Option<Error>>>,
) -> SubscriptionHandler {
    Arc::new(move |_topic: &str, payload: Bytes| {
        let tx = tx.clone();
        let sticky = Arc::clone(&sticky);
        let decoded: Result<WireMessage> = codec.unmarshal(&payload);
        Box::pin(async move {
            let msg = match decoded {
                Ok(msg) => msg,
                // An undecodable control frame poisons the call.
                Err(_) => {
                    sticky.lock().unwrap().get_or_insert(Error::InvalidMessage);
                    return;
                }
            };
            if let Some(err) = msg.as_error() {
                sticky.lock().unwrap().get_or_insert(err);
            }
            let _ = tx.send(msg).await;
        })
    })
}

/// Handler for a data topic: payloads are raw DATA frame bytes.
fn data_handler(tx: mpsc::Sender<WireMessage>) -> SubscriptionHandler {
    Arc::new(move |_topic: &str, payload: Bytes| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(WireMessage::data(payload)).await;
        })
    })
}
