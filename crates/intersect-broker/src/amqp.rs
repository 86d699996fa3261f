// SPDX-License-Identifier: MIT OR Apache-2.0
//! AMQP 0.9.1 backend (lapin).
//!
//! Messages flow through one durable topic exchange; topic patterns
//! translate to binding keys (`/` → `.`, `+` → `*`). Headers ride the
//! native `BasicProperties` header table, so no envelope prefix is needed.
//! A supervisor task rebuilds the connection, channel, and every consumer
//! after a connection error, pacing attempts with [`ReconnectBackoff`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::topic::{from_amqp_routing_key, to_amqp_binding_key, to_amqp_routing_key};
use crate::{
    BrokerClient, BrokerEndpoint, BrokerError, Credentials, InboundMessage, MessageCallback,
};

const EXCHANGE: &str = "intersect-messages";
const SUPERVISOR_PERIOD: Duration = Duration::from_millis(500);

struct ActiveConsumer {
    queue: String,
    tag: String,
}

struct State {
    connection: Connection,
    channel: Channel,
    consumers: BTreeMap<String, ActiveConsumer>,
}

/// AMQP 0.9.1 broker client over a shared topic exchange.
pub struct AmqpBroker {
    consumer_prefix: String,
    state: Arc<Mutex<Option<State>>>,
    subscriptions: Arc<std::sync::Mutex<BTreeMap<String, MessageCallback>>>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl AmqpBroker {
    /// Create a disconnected client; `consumer_prefix` namespaces consumer tags.
    #[must_use]
    pub fn new(consumer_prefix: impl Into<String>) -> Self {
        Self {
            consumer_prefix: consumer_prefix.into(),
            state: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(std::sync::Mutex::new(BTreeMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn establish(
    endpoint: &BrokerEndpoint,
    credentials: &Credentials,
    connected: &Arc<AtomicBool>,
) -> Result<(Connection, Channel), BrokerError> {
    let uri = format!(
        "amqp://{}:{}@{}:{}/%2f",
        credentials.username, credentials.password, endpoint.host, endpoint.port
    );
    let map_err = |reason: String| BrokerError::Connect {
        host: endpoint.host.clone(),
        port: endpoint.port,
        reason,
    };
    let connection = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .map_err(|e| map_err(e.to_string()))?;
    let connected = Arc::clone(connected);
    connection.on_error(move |error| {
        warn!(%error, "amqp connection error");
        connected.store(false, Ordering::SeqCst);
    });
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| map_err(e.to_string()))?;
    channel
        .exchange_declare(
            EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| map_err(e.to_string()))?;
    Ok((connection, channel))
}

async fn start_consumer(
    channel: &Channel,
    consumer_prefix: &str,
    pattern: &str,
    callback: MessageCallback,
) -> Result<ActiveConsumer, BrokerError> {
    let map_err = |reason: String| BrokerError::Subscribe {
        pattern: pattern.to_string(),
        reason,
    };
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| map_err(e.to_string()))?;
    let queue_name = queue.name().as_str().to_string();
    channel
        .queue_bind(
            &queue_name,
            EXCHANGE,
            &to_amqp_binding_key(pattern),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| map_err(e.to_string()))?;
    let tag = format!("{consumer_prefix}-{queue_name}");
    let mut consumer = channel
        .basic_consume(
            &queue_name,
            &tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| map_err(e.to_string()))?;

    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(error) => {
                    debug!(%error, "amqp consumer stream ended");
                    break;
                }
            };
            let topic = from_amqp_routing_key(delivery.routing_key.as_str());
            let content_type = delivery
                .properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string())
                .unwrap_or_default();
            let mut headers = BTreeMap::new();
            if let Some(table) = delivery.properties.headers().as_ref() {
                for (key, value) in table.inner() {
                    if let AMQPValue::LongString(s) = value {
                        headers.insert(
                            key.as_str().to_string(),
                            String::from_utf8_lossy(s.as_bytes()).to_string(),
                        );
                    }
                }
            }
            callback(InboundMessage {
                topic,
                payload: delivery.data.clone(),
                content_type,
                headers,
            });
            if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
                warn!(%error, "amqp ack failed");
            }
        }
    });

    Ok(ActiveConsumer {
        queue: queue_name,
        tag,
    })
}

#[async_trait]
impl BrokerClient for AmqpBroker {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &Credentials,
    ) -> Result<(), BrokerError> {
        {
            let state = self.state.lock().await;
            if state.is_some() {
                return Ok(());
            }
        }
        self.closed.store(false, Ordering::SeqCst);

        // cap total connect effort at the backoff ceiling before raising
        let mut backoff = ReconnectBackoff::new();
        let (connection, channel) = loop {
            match establish(endpoint, credentials, &self.connected).await {
                Ok(pair) => break pair,
                Err(error) if backoff.attempts() < 7 => {
                    let delay = backoff.next_delay();
                    warn!(%error, ?delay, "amqp connect failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        };
        self.connected.store(true, Ordering::SeqCst);
        *self.state.lock().await = Some(State {
            connection,
            channel,
            consumers: BTreeMap::new(),
        });

        // supervisor: rebuild connection and consumers after errors
        let state = Arc::clone(&self.state);
        let subscriptions = Arc::clone(&self.subscriptions);
        let connected = Arc::clone(&self.connected);
        let closed = Arc::clone(&self.closed);
        let endpoint = endpoint.clone();
        let credentials = credentials.clone();
        let consumer_prefix = self.consumer_prefix.clone();
        tokio::spawn(async move {
            let mut check = tokio::time::interval(SUPERVISOR_PERIOD);
            check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                check.tick().await;
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                if connected.load(Ordering::SeqCst) {
                    continue;
                }
                let mut backoff = ReconnectBackoff::new();
                loop {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    match establish(&endpoint, &credentials, &connected).await {
                        Ok((connection, channel)) => {
                            let snapshot: Vec<(String, MessageCallback)> = {
                                let subscriptions =
                                    subscriptions.lock().unwrap_or_else(|e| e.into_inner());
                                subscriptions
                                    .iter()
                                    .map(|(p, cb)| (p.clone(), Arc::clone(cb)))
                                    .collect()
                            };
                            let mut consumers = BTreeMap::new();
                            for (pattern, callback) in snapshot {
                                match start_consumer(&channel, &consumer_prefix, &pattern, callback)
                                    .await
                                {
                                    Ok(consumer) => {
                                        consumers.insert(pattern, consumer);
                                    }
                                    Err(error) => {
                                        warn!(%error, %pattern, "amqp resubscribe failed")
                                    }
                                }
                            }
                            *state.lock().await = Some(State {
                                connection,
                                channel,
                                consumers,
                            });
                            connected.store(true, Ordering::SeqCst);
                            info!("amqp connection reestablished");
                            break;
                        }
                        Err(error) => {
                            let delay = backoff.next_delay();
                            warn!(%error, ?delay, "amqp reconnect failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
        content_type: &str,
    ) -> Result<(), BrokerError> {
        let state = self.state.lock().await;
        let state = state.as_ref().ok_or(BrokerError::NotConnected)?;
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(value.clone().into()),
            );
        }
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type.to_string()))
            .with_headers(table);
        state
            .channel
            .basic_publish(
                EXCHANGE,
                &to_amqp_routing_key(topic),
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|error| BrokerError::Publish {
                topic: topic.to_string(),
                reason: error.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, callback: MessageCallback) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or(BrokerError::NotConnected)?;
        {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions.insert(pattern.to_string(), Arc::clone(&callback));
        }
        let consumer = start_consumer(&state.channel, &self.consumer_prefix, pattern, callback).await?;
        state.consumers.insert(pattern.to_string(), consumer);
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or(BrokerError::NotConnected)?;
        {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions.remove(pattern);
        }
        if let Some(consumer) = state.consumers.remove(pattern) {
            state
                .channel
                .basic_cancel(&consumer.tag, BasicCancelOptions::default())
                .await
                .map_err(|error| BrokerError::Subscribe {
                    pattern: pattern.to_string(),
                    reason: error.to_string(),
                })?;
            debug!(queue = %consumer.queue, "amqp consumer cancelled");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let state = self.state.lock().await.take();
        if let Some(state) = state {
            let _ = state.connection.close(200, "client shutdown").await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
