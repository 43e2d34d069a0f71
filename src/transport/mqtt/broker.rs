//! Broker client seam.
//!
//! The MQTT transport talks to the broker through the narrow
//! [`BrokerClient`] interface: connect, publish, subscribe,
//! unsubscribe, disconnect. [`RumqttcBroker`] implements it over a real
//! broker; [`super::memory::MemoryBroker`] implements it in-process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::BoxFuture;

/// Delivery guarantee class for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerQos {
    /// Fire and forget; used for DATA frames.
    AtMostOnce,
    /// Exactly once; used for control frames.
    ExactlyOnce,
}

impl From<BrokerQos> for QoS {
    fn from(qos: BrokerQos) -> Self {
        match qos {
            BrokerQos::AtMostOnce => QoS::AtMostOnce,
            BrokerQos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Callback invoked for each delivery on a subscription.
///
/// Receives the concrete publish topic and the payload. Implementations
/// await the returned future inline, preserving per-topic order.
pub type SubscriptionHandler = Arc<dyn Fn(&str, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// The broker operations the transport consumes.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establish the broker session.
    async fn connect(&self) -> Result<()>;

    /// Publish one message.
    async fn publish(&self, topic: &str, qos: BrokerQos, retain: bool, payload: Bytes)
        -> Result<()>;

    /// Subscribe a filter; `handler` runs for each matching delivery.
    async fn subscribe(&self, filter: &str, qos: BrokerQos, handler: SubscriptionHandler)
        -> Result<()>;

    /// Remove the subscription for `filter`.
    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Tear down the broker session.
    async fn disconnect(&self) -> Result<()>;
}

/// Match an MQTT topic against a subscription filter.
///
/// Supports the `+` single-level and `#` multi-level wildcards; a
/// `$share/<group>/` prefix on the filter is stripped before matching,
/// since deliveries carry the publish topic.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter = strip_share_prefix(filter);

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Strip a `$share/<group>/` prefix from a subscription filter.
pub(crate) fn strip_share_prefix(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_group, rest)| rest)
        .unwrap_or(filter)
}

struct ActiveSubscription {
    qos: BrokerQos,
    handler: SubscriptionHandler,
}

/// [`BrokerClient`] backed by rumqttc.
///
/// `connect()` spawns the event-loop task and waits for the first
/// CONNACK. The event loop reconnects with a fixed backoff; after every
/// reconnect all active subscription filters are replayed, so
/// registered servers survive broker restarts.
pub struct RumqttcBroker {
    addr: String,
    connect_timeout: Duration,
    client: StdMutex<Option<AsyncClient>>,
    subscriptions: Arc<RwLock<HashMap<String, ActiveSubscription>>>,
    connected: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    connecting: Mutex<()>,
}

impl RumqttcBroker {
    /// Create a broker client for `addr` (`mqtt://host:port` or
    /// `host:port`).
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            client: StdMutex::new(None),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            connecting: Mutex::new(()),
        }
    }

    fn current_client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Broker("not connected".into()))
    }

    fn parse_addr(&self) -> Result<(String, u16)> {
        let trimmed = self
            .addr
            .strip_prefix("mqtt://")
            .or_else(|| self.addr.strip_prefix("tcp://"))
            .unwrap_or(&self.addr);
        match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid broker port in {}", self.addr)))?;
                Ok((host.to_string(), port))
            }
            None => Ok((trimmed.to_string(), 1883)),
        }
    }
}

#[async_trait]
impl BrokerClient for RumqttcBroker {
    async fn connect(&self) -> Result<()> {
        let _guard = self.connecting.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let (host, port) = self.parse_addr()?;
        let client_id = format!("wirecall-{}", Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        *self.client.lock().unwrap() = Some(client.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut ready_tx = Some(ready_tx);
        let subscriptions = Arc::clone(&self.subscriptions);
        let connected = Arc::clone(&self.connected);
        self.stopped.store(false, Ordering::Release);
        let stopped = Arc::clone(&self.stopped);

        tokio::spawn(async move {
            loop {
                if stopped.load(Ordering::Acquire) {
                    return;
                }
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::Release);
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                        // Replay subscriptions after (re)connect.
                        let filters: Vec<(String, BrokerQos)> = subscriptions
                            .read()
                            .unwrap()
                            .iter()
                            .map(|(filter, sub)| (filter.clone(), sub.qos))
                            .collect();
                        for (filter, qos) in filters {
                            if let Err(e) = client.subscribe(&filter, qos.into()).await {
                                warn!("re-subscribe of {filter} failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let handler = {
                            let subs = subscriptions.read().unwrap();
                            subs.iter()
                                .find(|(filter, _)| topic_matches(filter, &publish.topic))
                                .map(|(_, sub)| Arc::clone(&sub.handler))
                        };
                        if let Some(handler) = handler {
                            handler(&publish.topic, publish.payload.clone()).await;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::Release);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if stopped.load(Ordering::Acquire) {
                            return;
                        }
                        if connected.swap(false, Ordering::AcqRel) {
                            warn!("broker connection lost: {e}");
                        } else {
                            debug!("broker reconnect pending: {e}");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        timeout(self.connect_timeout, ready_rx)
            .await?
            .map_err(|_| Error::Broker("connection closed during connect".into()))?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: BrokerQos,
        retain: bool,
        payload: Bytes,
    ) -> Result<()> {
        let client = self.current_client()?;
        client
            .publish(topic, qos.into(), retain, payload.to_vec())
            .await
            .map_err(|e| Error::Broker(e.to_string()))
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: BrokerQos,
        handler: SubscriptionHandler,
    ) -> Result<()> {
        let client = self.current_client()?;
        // Register before subscribing so no delivery races the handler.
        self.subscriptions
            .write()
            .unwrap()
            .insert(filter.to_string(), ActiveSubscription { qos, handler });

        if let Err(e) = client.subscribe(filter, qos.into()).await {
            self.subscriptions.write().unwrap().remove(filter);
            return Err(Error::Broker(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscriptions.write().unwrap().remove(filter);
        let client = self.current_client()?;
        client
            .unsubscribe(filter)
            .await
            .map_err(|e| Error::Broker(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("MQC/svc/echo/0/Control/abc", "MQC/svc/echo/0/Control/abc"));
        assert!(!topic_matches("MQC/svc/echo/0/Control/abc", "MQC/svc/echo/0/Control/xyz"));
        assert!(!topic_matches("MQC/a", "MQC/a/b"));
    }

    #[test]
    fn test_topic_matches_single_level_wildcard() {
        assert!(topic_matches("MQC/svc/echo/0/Control/+", "MQC/svc/echo/0/Control/id-1"));
        assert!(!topic_matches("MQC/svc/echo/0/Control/+", "MQC/svc/echo/0/Control/id-1/x"));
        assert!(topic_matches("MQC/+/0", "MQC/anything/0"));
    }

    #[test]
    fn test_topic_matches_multi_level_wildcard() {
        assert!(topic_matches("MQC/#", "MQC/svc/echo/0/Data/x"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn test_shared_subscription_prefix_stripped() {
        assert!(topic_matches(
            "$share/MQC/MQC/svc/echo/0/Control/+",
            "MQC/svc/echo/0/Control/id-7"
        ));
        assert_eq!(strip_share_prefix("$share/G/a/b"), "a/b");
        assert_eq!(strip_share_prefix("a/b"), "a/b");
    }

    #[test]
    fn test_parse_addr_variants() {
        let broker = RumqttcBroker::new("mqtt://broker.local:1884", Duration::from_secs(1));
        assert_eq!(broker.parse_addr().unwrap(), ("broker.local".into(), 1884));

        let broker = RumqttcBroker::new("localhost:1883", Duration::from_secs(1));
        assert_eq!(broker.parse_addr().unwrap(), ("localhost".into(), 1883));

        let broker = RumqttcBroker::new("mqtt://solo", Duration::from_secs(1));
        assert_eq!(broker.parse_addr().unwrap(), ("solo".into(), 1883));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let broker = RumqttcBroker::new("localhost:1883", Duration::from_secs(1));
        let r = broker
            .publish("t", BrokerQos::AtMostOnce, false, Bytes::new())
            .await;
        assert!(matches!(r, Err(Error::Broker(_))));
    }
}
