// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-topic handler chains on top of a [`BrokerClient`].
//!
//! Multiple independent observers can hang off one subscription — e.g. a
//! message inspector in front of the dispatch engine. Handlers run in
//! registration order on the backend's receive task; a handler returning
//! `false` stops the chain for that message.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::topic::valid_pattern;
use crate::{BrokerClient, BrokerError, InboundMessage};

/// One link in a channel's handler chain. Returns `true` to continue the
/// chain, `false` to stop it.
pub type ChannelHandler = Arc<dyn Fn(&InboundMessage) -> bool + Send + Sync>;

#[derive(Default)]
struct Registry {
    chains: BTreeMap<String, Vec<ChannelHandler>>,
}

/// Binds topic patterns to ordered handler chains over one broker client.
pub struct ChannelManager {
    broker: Arc<dyn BrokerClient>,
    registry: Arc<Mutex<Registry>>,
}

impl ChannelManager {
    /// Create a manager over an already-constructed broker client.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// The underlying broker client.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.broker
    }

    /// Append a handler to the chain for `pattern`, subscribing on the
    /// broker the first time the pattern is seen.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidPattern`] for malformed patterns, otherwise
    /// whatever the backend's subscribe returns.
    pub async fn register(
        &self,
        pattern: &str,
        handler: ChannelHandler,
    ) -> Result<(), BrokerError> {
        if !valid_pattern(pattern) {
            return Err(BrokerError::InvalidPattern(pattern.to_string()));
        }
        let first_for_pattern = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let chain = registry.chains.entry(pattern.to_string()).or_default();
            chain.push(handler);
            chain.len() == 1
        };
        if first_for_pattern {
            let registry = Arc::clone(&self.registry);
            let owned_pattern = pattern.to_string();
            let callback: crate::MessageCallback = Arc::new(move |message: InboundMessage| {
                let chain = {
                    let registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                    registry.chains.get(&owned_pattern).cloned().unwrap_or_default()
                };
                for handler in chain {
                    if !handler(&message) {
                        debug!(topic = %message.topic, "handler chain stopped early");
                        break;
                    }
                }
            });
            self.broker.subscribe(pattern, callback).await?;
        }
        Ok(())
    }

    /// Drop every handler for `pattern` and unsubscribe from the broker.
    ///
    /// # Errors
    ///
    /// Whatever the backend's unsubscribe returns.
    pub async fn unregister(&self, pattern: &str) -> Result<(), BrokerError> {
        let had_chain = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.chains.remove(pattern).is_some()
        };
        if had_chain {
            self.broker.unsubscribe(pattern).await?;
        }
        Ok(())
    }

    /// Patterns currently bound to at least one handler.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.chains.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use crate::{BrokerEndpoint, Credentials};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn connected_manager(hub: &MemoryHub) -> ChannelManager {
        let broker = Arc::new(hub.client());
        broker
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
        ChannelManager::new(broker)
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let hub = MemoryHub::new();
        let manager = connected_manager(&hub).await;
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            manager
                .register(
                    "a/b",
                    Arc::new(move |_| {
                        order.lock().unwrap().push(tag);
                        true
                    }),
                )
                .await
                .unwrap();
        }

        manager
            .broker()
            .publish("a/b", b"x", &BTreeMap::new(), "text/plain")
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn false_stops_the_chain() {
        let hub = MemoryHub::new();
        let manager = connected_manager(&hub).await;
        let reached = Arc::new(AtomicUsize::new(0));

        manager.register("a/b", Arc::new(|_| false)).await.unwrap();
        let reached_clone = Arc::clone(&reached);
        manager
            .register(
                "a/b",
                Arc::new(move |_| {
                    reached_clone.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            )
            .await
            .unwrap();

        manager
            .broker()
            .publish("a/b", b"x", &BTreeMap::new(), "text/plain")
            .await
            .unwrap();
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_pattern_rejected() {
        let hub = MemoryHub::new();
        let manager = connected_manager(&hub).await;
        let err = manager.register("a/#/b", Arc::new(|_| true)).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn unregister_removes_subscription() {
        let hub = MemoryHub::new();
        let manager = connected_manager(&hub).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        manager
            .register(
                "a/+",
                Arc::new(move |_| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            )
            .await
            .unwrap();
        manager.unregister("a/+").await.unwrap();
        manager
            .broker()
            .publish("a/b", b"x", &BTreeMap::new(), "text/plain")
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(manager.patterns().is_empty());
    }
}
