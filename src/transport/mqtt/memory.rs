//! In-process broker.
//!
//! Implements the [`BrokerClient`] contract without a network: every
//! client created from one [`MemoryBroker`] shares its topic space.
//! `$share/<group>/` subscriptions are load-balanced round-robin within
//! the group, mirroring broker-side shared subscriptions. Used by the
//! test suite and useful for single-process wiring.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wirecall::transport::mqtt::{MemoryBroker, MqttTransport};
//! use wirecall::transport::TransportOptions;
//!
//! let broker = Arc::new(MemoryBroker::new());
//! let transport = MqttTransport::with_client(
//!     TransportOptions::new().address("memory"),
//!     broker.client(),
//! )
//! .unwrap();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

use super::broker::{strip_share_prefix, topic_matches, BrokerClient, BrokerQos, SubscriptionHandler};

struct Subscription {
    client_id: u64,
    /// Filter as given at subscribe time, `$share` prefix included.
    raw_filter: String,
    /// Filter actually matched against publish topics.
    filter: String,
    /// Shared-subscription group, if any.
    group: Option<String>,
    handler: SubscriptionHandler,
}

/// A process-local broker hub.
#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: StdMutex<Vec<Arc<Subscription>>>,
    /// Round-robin cursor per (group, filter).
    cursors: StdMutex<HashMap<(String, String), usize>>,
    next_client_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client handle bound to this hub.
    ///
    /// Each transport needs its own client: subscriptions are owned per
    /// client, and shared-group balancing distinguishes clients.
    pub fn client(self: &Arc<Self>) -> Arc<dyn BrokerClient> {
        Arc::new(MemoryClient {
            hub: Arc::clone(self),
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    async fn route(&self, topic: &str, payload: Bytes) {
        // Snapshot matching handlers, then deliver without the lock.
        let mut direct: Vec<Arc<Subscription>> = Vec::new();
        let mut grouped: HashMap<(String, String), Vec<Arc<Subscription>>> = HashMap::new();
        {
            let subs = self.subscriptions.lock().unwrap();
            for sub in subs.iter() {
                if !topic_matches(&sub.filter, topic) {
                    continue;
                }
                match &sub.group {
                    None => direct.push(Arc::clone(sub)),
                    Some(group) => grouped
                        .entry((group.clone(), sub.filter.clone()))
                        .or_default()
                        .push(Arc::clone(sub)),
                }
            }
        }

        for sub in direct {
            (sub.handler)(topic, payload.clone()).await;
        }

        // One delivery per shared group, rotating through its members.
        for (key, members) in grouped {
            let index = {
                let mut cursors = self.cursors.lock().unwrap();
                let cursor = cursors.entry(key).or_insert(0);
                let index = *cursor % members.len();
                *cursor = cursor.wrapping_add(1);
                index
            };
            (members[index].handler)(topic, payload.clone()).await;
        }
    }

    fn add_subscription(&self, sub: Subscription) {
        self.subscriptions.lock().unwrap().push(Arc::new(sub));
    }

    fn remove_subscription(&self, client_id: u64, raw_filter: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|sub| !(sub.client_id == client_id && sub.raw_filter == raw_filter));
    }

    fn remove_client(&self, client_id: u64) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|sub| sub.client_id != client_id);
    }
}

struct MemoryClient {
    hub: Arc<MemoryBroker>,
    id: u64,
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        _qos: BrokerQos,
        retain: bool,
        payload: Bytes,
    ) -> Result<()> {
        if retain {
            return Err(Error::Unsupported);
        }
        self.hub.route(topic, payload).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: BrokerQos,
        handler: SubscriptionHandler,
    ) -> Result<()> {
        let group = filter
            .strip_prefix("$share/")
            .and_then(|rest| rest.split_once('/'))
            .map(|(group, _)| group.to_string());

        self.hub.add_subscription(Subscription {
            client_id: self.id,
            raw_filter: filter.to_string(),
            filter: strip_share_prefix(filter).to_string(),
            group,
            handler,
        });
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.hub.remove_subscription(self.id, filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.hub.remove_client(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn collector() -> (SubscriptionHandler, mpsc::Receiver<(String, Bytes)>) {
        let (tx, rx) = mpsc::channel(64);
        let handler: SubscriptionHandler = Arc::new(move |topic: &str, payload: Bytes| {
            let tx = tx.clone();
            let topic = topic.to_string();
            Box::pin(async move {
                let _ = tx.send((topic, payload)).await;
            })
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let hub = Arc::new(MemoryBroker::new());
        let client = hub.client();

        let (handler, mut rx) = collector();
        client
            .subscribe("MQC/t/+", BrokerQos::AtMostOnce, handler)
            .await
            .unwrap();

        client
            .publish("MQC/t/1", BrokerQos::AtMostOnce, false, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "MQC/t/1");
        assert_eq!(payload, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = Arc::new(MemoryBroker::new());
        let client = hub.client();

        let (handler, mut rx) = collector();
        client
            .subscribe("MQC/t", BrokerQos::AtMostOnce, handler)
            .await
            .unwrap();
        client.unsubscribe("MQC/t").await.unwrap();

        client
            .publish("MQC/t", BrokerQos::AtMostOnce, false, Bytes::new())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shared_group_round_robin() {
        let hub = Arc::new(MemoryBroker::new());
        let replica_a = hub.client();
        let replica_b = hub.client();

        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        for (client, count) in [(&replica_a, &count_a), (&replica_b, &count_b)] {
            let count = Arc::clone(count);
            let handler: SubscriptionHandler = Arc::new(move |_t: &str, _p: Bytes| {
                let count = Arc::clone(&count);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            });
            client
                .subscribe("$share/G/MQC/m/Control/+", BrokerQos::ExactlyOnce, handler)
                .await
                .unwrap();
        }

        let publisher = hub.client();
        for i in 0..10 {
            publisher
                .publish(
                    &format!("MQC/m/Control/id-{i}"),
                    BrokerQos::ExactlyOnce,
                    false,
                    Bytes::new(),
                )
                .await
                .unwrap();
        }

        // Each delivery went to exactly one group member, spread evenly.
        assert_eq!(count_a.load(Ordering::SeqCst), 5);
        assert_eq!(count_b.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_clients_are_isolated_for_unsubscribe() {
        let hub = Arc::new(MemoryBroker::new());
        let one = hub.client();
        let two = hub.client();

        let (handler_one, mut rx_one) = collector();
        let (handler_two, mut rx_two) = collector();
        one.subscribe("MQC/t", BrokerQos::AtMostOnce, handler_one)
            .await
            .unwrap();
        two.subscribe("MQC/t", BrokerQos::AtMostOnce, handler_two)
            .await
            .unwrap();

        // Unsubscribing one client leaves the other's subscription.
        one.unsubscribe("MQC/t").await.unwrap();
        two.publish("MQC/t", BrokerQos::AtMostOnce, false, Bytes::new())
            .await
            .unwrap();

        assert!(rx_one.try_recv().is_err());
        assert!(rx_two.recv().await.is_some());
    }
}
