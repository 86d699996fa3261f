// SPDX-License-Identifier: MIT OR Apache-2.0
//! MQTT backend (rumqttc).
//!
//! MQTT 3.1.1 carries no per-message properties, so headers and the
//! content type ride the reserved envelope prefix (see [`crate::prefix`]).
//! QoS 1 gives the at-least-once contract; duplicate suppression is the
//! dispatch layer's job.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backoff::ReconnectBackoff;
use crate::topic::topic_matches;
use crate::{
    BrokerClient, BrokerEndpoint, BrokerError, Credentials, InboundMessage, MessageCallback, prefix,
};

const CONNECT_WAIT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct Shared {
    subscriptions: Mutex<BTreeMap<String, MessageCallback>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn deliver(&self, topic: &str, frame: &[u8]) {
        let callbacks: Vec<MessageCallback> = {
            let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, topic))
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        if callbacks.is_empty() {
            return;
        }
        let (headers, content_type, payload) = prefix::decode(frame);
        for callback in callbacks {
            callback(InboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                content_type: content_type.clone(),
                headers: headers.clone(),
            });
        }
    }
}

/// MQTT 3.1.1 broker client.
pub struct MqttBroker {
    client_id: String,
    client: Mutex<Option<AsyncClient>>,
    shared: Arc<Shared>,
}

impl MqttBroker {
    /// Create a disconnected client with the given MQTT client id.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client: Mutex::new(None),
            shared: Arc::new(Shared::default()),
        }
    }

    fn current_client(&self) -> Result<AsyncClient, BrokerError> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(BrokerError::NotConnected)
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &Credentials,
    ) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Ok(());
        }
        self.shared.closed.store(false, Ordering::SeqCst);
        let mut options =
            MqttOptions::new(self.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
        options.set_keep_alive(KEEP_ALIVE);
        let (client, mut event_loop) = AsyncClient::new(options, EVENT_CAPACITY);

        let shared = Arc::clone(&self.shared);
        let resubscriber = client.clone();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut backoff = ReconnectBackoff::new();
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        shared.connected.store(true, Ordering::SeqCst);
                        backoff.reset();
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                        // the broker forgets session state between connects
                        let patterns: Vec<String> = {
                            let subs = shared
                                .subscriptions
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            subs.keys().cloned().collect()
                        };
                        for pattern in patterns {
                            if let Err(error) =
                                resubscriber.subscribe(pattern.clone(), QoS::AtLeastOnce).await
                            {
                                warn!(%pattern, %error, "mqtt resubscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        shared.deliver(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        shared.connected.store(false, Ordering::SeqCst);
                        if shared.closed.load(Ordering::SeqCst) {
                            debug!("mqtt event loop closed");
                            return;
                        }
                        let delay = backoff.next_delay();
                        warn!(%error, ?delay, "mqtt connection lost, backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        timeout(CONNECT_WAIT, ready_rx)
            .await
            .map_err(|_| BrokerError::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                reason: format!("no CONNACK within {CONNECT_WAIT:?}"),
            })?
            .map_err(|_| BrokerError::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                reason: "event loop terminated before CONNACK".to_string(),
            })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
        content_type: &str,
    ) -> Result<(), BrokerError> {
        let client = self.current_client()?;
        let frame = prefix::encode(headers, content_type, payload);
        client
            .publish(topic, QoS::AtLeastOnce, false, frame)
            .await
            .map_err(|error| BrokerError::Publish {
                topic: topic.to_string(),
                reason: error.to_string(),
            })
    }

    async fn subscribe(&self, pattern: &str, callback: MessageCallback) -> Result<(), BrokerError> {
        let client = self.current_client()?;
        {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subscriptions.insert(pattern.to_string(), callback);
        }
        client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|error| BrokerError::Subscribe {
                pattern: pattern.to_string(),
                reason: error.to_string(),
            })
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        let client = self.current_client()?;
        {
            let mut subscriptions = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subscriptions.remove(pattern);
        }
        client
            .unsubscribe(pattern)
            .await
            .map_err(|error| BrokerError::Subscribe {
                pattern: pattern.to_string(),
                reason: error.to_string(),
            })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        let client = {
            let mut slot = self.client.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}
