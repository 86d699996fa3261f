// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process broker used by tests and single-process deployments.
//!
//! A [`MemoryHub`] plays the role of the broker server; every
//! [`MemoryBroker`] handed out by [`MemoryHub::client`] is an independent
//! client connection. Delivery is synchronous on the publisher's task,
//! which mirrors a backend invoking callbacks on its receive thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::topic::{topic_matches, valid_pattern};
use crate::{BrokerClient, BrokerEndpoint, BrokerError, Credentials, InboundMessage, MessageCallback};

struct Subscription {
    client_id: u64,
    pattern: String,
    callback: MessageCallback,
}

#[derive(Default)]
struct HubInner {
    subscriptions: Mutex<Vec<Subscription>>,
    delivered: AtomicU64,
    next_client: AtomicU64,
}

/// The shared in-process "broker server".
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new client connection to this hub.
    #[must_use]
    pub fn client(&self) -> MemoryBroker {
        MemoryBroker {
            hub: self.clone(),
            client_id: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
        }
    }

    /// Total messages delivered to subscribers since creation.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    fn deliver(&self, topic: &str, message: &InboundMessage) {
        let matching: Vec<MessageCallback> = {
            let subscriptions = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subscriptions
                .iter()
                .filter(|s| topic_matches(&s.pattern, topic))
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };
        for callback in matching {
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            callback(message.clone());
        }
    }

    fn drop_client(&self, client_id: u64) {
        let mut subscriptions = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|s| s.client_id != client_id);
    }
}

/// One client connection to a [`MemoryHub`].
pub struct MemoryBroker {
    hub: MemoryHub,
    client_id: u64,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(
        &self,
        _endpoint: &BrokerEndpoint,
        _credentials: &Credentials,
    ) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
        content_type: &str,
    ) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            content_type: content_type.to_string(),
            headers: headers.clone(),
        };
        self.hub.deliver(topic, &message);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, callback: MessageCallback) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if !valid_pattern(pattern) {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }
        let mut subscriptions = self
            .hub
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscriptions.push(Subscription {
            client_id: self.client_id,
            pattern: pattern.to_string(),
            callback,
        });
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        let mut subscriptions = self
            .hub
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|s| !(s.client_id == self.client_id && s.pattern == pattern));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.drop_client(self.client_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    async fn connected(hub: &MemoryHub) -> MemoryBroker {
        let client = hub.client();
        client
            .connect(
                &BrokerEndpoint {
                    host: "localhost".into(),
                    port: 0,
                },
                &Credentials {
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let hub = MemoryHub::new();
        let publisher = connected(&hub).await;
        let subscriber = connected(&hub).await;

        let seen: Arc<StdMutex<Vec<InboundMessage>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        subscriber
            .subscribe(
                "o/f/s/-/svc/#",
                Arc::new(move |m| seen_clone.lock().unwrap().push(m)),
            )
            .await
            .unwrap();

        let headers = BTreeMap::from([("k".to_string(), "v".to_string())]);
        publisher
            .publish("o/f/s/-/svc/userspace", b"payload", &headers, "application/json")
            .await
            .unwrap();
        publisher
            .publish("o/f/s/-/other/userspace", b"payload", &headers, "application/json")
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "o/f/s/-/svc/userspace");
        assert_eq!(seen[0].payload, b"payload");
        assert_eq!(seen[0].headers["k"], "v");
        assert_eq!(seen[0].content_type, "application/json");
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let hub = MemoryHub::new();
        let client = hub.client();
        let err = client
            .publish("t", b"x", &BTreeMap::new(), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn close_drops_subscriptions() {
        let hub = MemoryHub::new();
        let publisher = connected(&hub).await;
        let subscriber = connected(&hub).await;
        subscriber.subscribe("t", Arc::new(|_| ())).await.unwrap();
        subscriber.close().await.unwrap();
        publisher
            .publish("t", b"x", &BTreeMap::new(), "text/plain")
            .await
            .unwrap();
        assert_eq!(hub.delivered(), 0);
    }
}
