//! Topic-direct pub/sub call.
//!
//! PUBLISHER and CONSUMER methods bypass the per-call id scheme: all
//! traffic flows on the single shared topic `MQC/<name>` with no
//! INVOKE/ACK handshake. `send_close` is not supported.

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
use crate::transport::mqtt::call::topics;
use crate::transport::Call;

/// Queue depth for consumed publications.
const INBOUND_QUEUE: usize = 16;

/// Call connection for a pub/sub method.
pub(crate) struct PubSubCall {
    client: Arc<dyn BrokerClient>,
    codec: PayloadCodec,
    topic: String,
    consumer: bool,
    inbound: Mutex<mpsc::Receiver<WireMessage>>,
    sticky: Arc<StdMutex<Option<Error>>>,
    closed: AtomicBool,
}

impl PubSubCall {
    /// Build a pub/sub call; consumers subscribe to the shared topic.
    pub(crate) async fn connect(
        client: Arc<dyn BrokerClient>,
        codec: PayloadCodec,
        method: &Method,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

        let call = Arc::new(Self {
            client: Arc::clone(&client),
            codec,
            topic: topics::pubsub(method),
            consumer: method.is_consumer(),
            inbound: Mutex::new(rx),
            sticky: Arc::new(StdMutex::new(None)),
            closed: AtomicBool::new(false),
        });

        if call.consumer {
            let handler: SubscriptionHandler = Arc::new(move |_topic: &str, payload: Bytes| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(WireMessage::data(payload)).await;
                })
            });
            client
                .subscribe(&call.topic, BrokerQos::AtMostOnce, handler)
                .await?;
        }

        Ok(call)
    }

    fn sticky_err(&self) -> Option<Error> {
        self.sticky.lock().unwrap().clone()
    }

    fn latch(&self, err: Error) -> Error {
        let mut slot = self.sticky.lock().unwrap();
        slot.get_or_insert(err).clone()
    }
}

#[async_trait]
impl Call for PubSubCall {
    async fn send(&self, data: Bytes) -> Result<()> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        self.client
            .publish(&self.topic, BrokerQos::AtMostOnce, false, data)
            .await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        match self.inbound.lock().await.recv().await {
            None => match self.sticky_err() {
                Some(e) => Err(e),
                None => Ok(None),
            },
            Some(msg) if msg.is_data() => Ok(Some(msg.data)),
            Some(_) => Err(self.latch(Error::ProtocolViolation)),
        }
    }

    async fn send_close(&self) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.latch(Error::ConnectionClosed);
        if self.consumer {
            self.client.unsubscribe(&self.topic).await?;
        }
        Ok(())
    }

    fn codec(&self) -> PayloadCodec {
        self.codec
    }
}
