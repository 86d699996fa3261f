// SPDX-License-Identifier: MIT OR Apache-2.0
//! Serialized outbound publishing.
//!
//! All outbound traffic funnels through one forwarding task, so messages
//! enqueued from the same handler invocation reach the broker in enqueue
//! order (the event-ordering guarantee), and synchronous code can publish
//! without holding a runtime handle.

use crate::BrokerClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// One message queued for the broker.
#[derive(Debug)]
pub struct Outbound {
    /// Target topic.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Broker header properties.
    pub headers: BTreeMap<String, String>,
    /// Content type string.
    pub content_type: String,
}

/// Handle for enqueueing outbound messages.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Publisher {
    /// Spawn the forwarding task over `broker` and return the handle.
    #[must_use]
    pub fn start(broker: Arc<dyn BrokerClient>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                if let Err(error) = broker
                    .publish(
                        &outbound.topic,
                        &outbound.payload,
                        &outbound.headers,
                        &outbound.content_type,
                    )
                    .await
                {
                    // transport failures are not userspace errors; the
                    // backend retries the connection underneath
                    warn!(topic = %outbound.topic, %error, "outbound publish failed");
                }
            }
        });
        Self { tx }
    }

    /// Enqueue a message. Drops with a warning after shutdown.
    pub fn send(&self, outbound: Outbound) {
        if self.tx.send(outbound).is_err() {
            warn!("publisher stopped, dropping outbound message");
        }
    }
}
