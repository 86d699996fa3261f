// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! intersect-broker
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Delivery is at-least-once on every backend; duplicate suppression by
//! `message_id` belongs to the dispatch layer, not here.

pub mod amqp;
pub mod backoff;
pub mod channel;
pub mod memory;
pub mod mqtt;
pub mod outbound;
pub mod prefix;
pub mod topic;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub use backoff::ReconnectBackoff;
pub use channel::{ChannelHandler, ChannelManager};
pub use memory::{MemoryBroker, MemoryHub};
pub use outbound::{Outbound, Publisher};

/// A message as delivered by a broker backend.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Concrete topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Content type of the payload, as a UTF-8 string.
    pub content_type: String,
    /// Per-message header properties.
    pub headers: BTreeMap<String, String>,
}

/// Subscription callback, invoked on the backend's receive task.
///
/// Callbacks must not block; hand real work to a dispatch pool.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Network location of a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

/// Authentication material for a broker connection.
#[derive(Clone)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never leak the password into logs
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Errors surfaced by broker backends.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The operation requires an established connection.
    #[error("broker is not connected")]
    NotConnected,

    /// Connecting to the broker failed.
    #[error("broker connection to {host}:{port} failed: {reason}")]
    Connect {
        /// Broker host.
        host: String,
        /// Broker port.
        port: u16,
        /// Backend-specific failure description.
        reason: String,
    },

    /// Publishing a message failed.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Backend-specific failure description.
        reason: String,
    },

    /// Managing a subscription failed.
    #[error("subscription '{pattern}' failed: {reason}")]
    Subscribe {
        /// Topic pattern.
        pattern: String,
        /// Backend-specific failure description.
        reason: String,
    },

    /// The given topic pattern is not valid.
    #[error("invalid topic pattern '{0}'")]
    InvalidPattern(String),
}

/// The pluggable publish/subscribe contract every backend implements.
///
/// Guarantees common to all backends:
/// - at-least-once delivery; duplicates are possible after reconnect
/// - `+`/`#` wildcard patterns work uniformly (see [`topic`])
/// - string header properties survive a round trip; backends without
///   native header support embed them via [`prefix`]
/// - reconnection uses [`ReconnectBackoff`] internally
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establish the connection. Idempotent once connected.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        credentials: &Credentials,
    ) -> Result<(), BrokerError>;

    /// Publish payload bytes with per-message headers.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
        content_type: &str,
    ) -> Result<(), BrokerError>;

    /// Subscribe a callback to a topic pattern.
    async fn subscribe(&self, pattern: &str, callback: MessageCallback) -> Result<(), BrokerError>;

    /// Remove a subscription previously made with [`subscribe`](Self::subscribe).
    async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError>;

    /// Close the connection and drop all subscriptions.
    async fn close(&self) -> Result<(), BrokerError>;

    /// `true` while the connection is believed healthy.
    fn is_connected(&self) -> bool;
}
