// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! intersect-client
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Symmetric to the service role but without a capability surface: no
//! status probe, no schema advertisement. A client owns a generated
//! identity, sends userspace requests, and feeds replies and subscribed
//! events into user callbacks. Callbacks return the next batch of traffic,
//! or [`ClientLoopExit`] to stop the processing loop — the terminate
//! signal is explicit, never an unwound panic.

use intersect_broker::{
    BrokerClient, BrokerEndpoint, BrokerError, ChannelManager, Credentials, Outbound, Publisher,
};
use intersect_config::{BrokerSelection, ClientCallbackConfig, ClientConfig, ConfigError};
use intersect_core::message::{payload_to_value, value_to_payload};
use intersect_core::{
    ErrorRecord, EventMessage, Hierarchy, MessageValidationError, UserspaceMessage,
    UserspaceMessageOptions, resolve_peer_version,
};
use intersect_schema::DirectMessageParams;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SEEN_CAPACITY: usize = 1024;

/// Explicit terminate signal returned from a callback to stop the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLoopExit;

/// What a callback hands back: more traffic, nothing, or the exit signal.
pub type CallbackResult = Result<Option<ClientCallbackConfig>, ClientLoopExit>;

/// Invoked for every operation reply:
/// `(source, operation_id, has_error, payload)`.
pub type ResponseCallback = dyn Fn(&str, &str, bool, Value) -> CallbackResult + Send + Sync;

/// Invoked for every subscribed event:
/// `(source, capability_name, event_name, payload)`.
pub type EventCallback = dyn Fn(&str, &str, &str, Value) -> CallbackResult + Send + Sync;

/// Client construction or startup failure.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration failed validation (startup-fatal).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Broker connection or subscription failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// `brokers = "discovery"` must be resolved before startup.
    #[error("broker selection 'discovery' must be resolved before startup")]
    DiscoveryUnresolved,
}

struct SeenIds {
    order: VecDeque<Uuid>,
    set: HashSet<Uuid>,
}

impl SeenIds {
    fn first_sighting(&mut self, id: Uuid) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

struct ClientShared {
    hierarchy: Hierarchy,
    local_name: String,
    config: ClientConfig,
    channels: ChannelManager,
    publisher: Publisher,
    on_response: Option<Arc<ResponseCallback>>,
    on_event: Option<Arc<EventCallback>>,
    terminated: AtomicBool,
    stopped: Notify,
    seen: Mutex<SeenIds>,
}

impl ClientShared {
    fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            info!(client = %self.local_name, "processing loop terminated");
        }
        self.stopped.notify_waiters();
    }

    fn send_message(&self, params: &DirectMessageParams) {
        let Ok(destination) = Hierarchy::parse(&params.destination) else {
            warn!(destination = %params.destination, "destination is not a hierarchy, dropping");
            return;
        };
        let Some(payload) = value_to_payload(params.content_type, &params.payload) else {
            warn!(operation = %params.operation, "payload does not fit its content type, dropping");
            return;
        };
        let message = UserspaceMessage::create(
            self.local_name.clone(),
            params.destination.clone(),
            params.operation.clone(),
            payload,
            UserspaceMessageOptions {
                content_type: params.content_type,
                data_handler: params.data_handler,
                ..UserspaceMessageOptions::default()
            },
        );
        match message.serialize() {
            Ok(bytes) => self.publisher.send(Outbound {
                topic: destination.inbox_topic(),
                payload: bytes,
                headers: BTreeMap::from([("source".to_string(), self.local_name.clone())]),
                content_type: params.content_type.mime().to_string(),
            }),
            Err(error) => warn!(%error, "request serialization failed"),
        }
    }

    async fn apply_bundle(self: &Arc<Self>, bundle: ClientCallbackConfig) {
        for message in &bundle.messages_to_send {
            self.send_message(message);
        }
        for name in &bundle.services_to_start_listening_for_events {
            match Hierarchy::parse(name) {
                Ok(hierarchy) => {
                    let pattern = hierarchy.all_events_pattern();
                    let weak = Arc::downgrade(self);
                    let handler: intersect_broker::ChannelHandler = Arc::new(move |message| {
                        if let Some(shared) = weak.upgrade() {
                            shared.handle_event_bytes(&message.payload);
                        }
                        true
                    });
                    if let Err(error) = self.channels.register(&pattern, handler).await {
                        warn!(%error, service = %name, "event subscription failed");
                    }
                }
                Err(error) => warn!(%error, service = %name, "not a hierarchy, skipping"),
            }
        }
        for name in &bundle.services_to_stop_listening_for_events {
            if let Ok(hierarchy) = Hierarchy::parse(name) {
                if let Err(error) = self.channels.unregister(&hierarchy.all_events_pattern()).await {
                    warn!(%error, service = %name, "event unsubscription failed");
                }
            }
        }
    }

    /// Reply path: validate, version-check, hand to the response callback.
    fn handle_reply_bytes(self: &Arc<Self>, bytes: &[u8]) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let message = match UserspaceMessage::deserialize_and_validate(bytes) {
            Ok(message) => message,
            Err(MessageValidationError::Malformed(reason)) => {
                info!(%reason, "dropping unparseable reply");
                return;
            }
            Err(MessageValidationError::Invalid(errors)) => {
                info!(%errors, "dropping invalid reply");
                return;
            }
        };
        if message.headers.destination != self.local_name {
            return;
        }
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.first_sighting(message.message_id) {
                debug!(message_id = %message.message_id, "duplicate reply suppressed");
                return;
            }
        }
        if !resolve_peer_version(&message.headers.sdk_version, &message.headers.source) {
            return;
        }
        let Some(callback) = self.on_response.clone() else {
            debug!("no response callback installed, dropping reply");
            return;
        };
        let payload =
            payload_to_value(message.content_type, &message.payload).unwrap_or(Value::Null);
        if message.headers.has_error {
            match ErrorRecord::from_payload(&message.payload) {
                Ok(record) => info!(code = %record.code, reason = %record.message, "error reply received"),
                Err(_) => info!("error reply received with unstructured payload"),
            }
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            // callbacks may sleep; keep them off the runtime workers
            let outcome = tokio::task::spawn_blocking(move || {
                callback(
                    &message.headers.source,
                    &message.operation_id,
                    message.headers.has_error,
                    payload,
                )
            })
            .await;
            shared.finish_callback(outcome).await;
        });
    }

    /// Event path: validate the envelope, hand to the event callback.
    fn handle_event_bytes(self: &Arc<Self>, bytes: &[u8]) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let event = match EventMessage::deserialize_and_validate(bytes) {
            Ok(event) => event,
            Err(error) => {
                info!(%error, "dropping invalid event message");
                return;
            }
        };
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.first_sighting(event.headers.message_id) {
                return;
            }
        }
        if !resolve_peer_version(&event.headers.sdk_version, &event.headers.source) {
            return;
        }
        let Some(callback) = self.on_event.clone() else {
            debug!("no event callback installed, dropping event");
            return;
        };
        let payload = payload_to_value(event.content_type, &event.payload).unwrap_or(Value::Null);

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                callback(
                    &event.headers.source,
                    &event.headers.capability_name,
                    &event.headers.event_name,
                    payload,
                )
            })
            .await;
            shared.finish_callback(outcome).await;
        });
    }

    async fn finish_callback(self: &Arc<Self>, outcome: Result<CallbackResult, tokio::task::JoinError>) {
        match outcome {
            Ok(Ok(Some(bundle))) => self.apply_bundle(bundle).await,
            Ok(Ok(None)) => {}
            Ok(Err(ClientLoopExit)) => self.terminate(),
            Err(join_error) => {
                warn!(%join_error, "callback panicked, terminating loop");
                self.terminate();
            }
        }
    }
}

/// A broker-attached INTERSECT client.
///
/// Construct inside a tokio runtime: the publisher task spawns
/// immediately.
pub struct IntersectClient {
    shared: Arc<ClientShared>,
}

impl IntersectClient {
    /// Build a client with a generated identity.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] when the configuration is invalid.
    pub fn new(
        config: ClientConfig,
        broker: Arc<dyn BrokerClient>,
        on_response: Option<Arc<ResponseCallback>>,
        on_event: Option<Arc<EventCallback>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        // ephemeral identity; the reply path stays symmetric with services
        let suffix = format!("c{}", Uuid::new_v4().simple());
        let hierarchy = Hierarchy {
            organization: "intersect-client".to_string(),
            facility: "client".to_string(),
            system: "client".to_string(),
            subsystem: None,
            service: suffix,
        };
        let local_name = hierarchy.name();
        let publisher = Publisher::start(Arc::clone(&broker));
        let channels = ChannelManager::new(broker);
        Ok(Self {
            shared: Arc::new(ClientShared {
                hierarchy,
                local_name,
                config,
                channels,
                publisher,
                on_response,
                on_event,
                terminated: AtomicBool::new(false),
                stopped: Notify::new(),
                seen: Mutex::new(SeenIds {
                    order: VecDeque::with_capacity(SEEN_CAPACITY),
                    set: HashSet::with_capacity(SEEN_CAPACITY),
                }),
            }),
        })
    }

    /// The generated identity replies are addressed to.
    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.shared.hierarchy
    }

    /// `true` once a callback returned [`ClientLoopExit`] (or panicked).
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Connect, subscribe the reply channel, and apply the initial
    /// message/event bundle.
    ///
    /// # Errors
    ///
    /// Broker connection/subscription failures.
    pub async fn startup(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        let (endpoint, credentials) = broker_target(&shared.config.brokers)?;
        shared.channels.broker().connect(&endpoint, &credentials).await?;

        let weak: Weak<ClientShared> = Arc::downgrade(shared);
        shared
            .channels
            .register(
                &shared.hierarchy.reply_topic(),
                Arc::new(move |message| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_reply_bytes(&message.payload);
                    }
                    true
                }),
            )
            .await?;

        let initial = shared.config.initial_message_event_config.clone();
        shared.apply_bundle(initial).await;
        info!(client = %shared.local_name, "client ready");
        Ok(())
    }

    /// Send one message outside a callback bundle.
    pub fn send(&self, params: &DirectMessageParams) {
        self.shared.send_message(params);
    }

    /// Block until a callback terminates the loop.
    pub async fn wait_until_terminated(&self) {
        while !self.is_terminated() {
            let notified = self.shared.stopped.notified();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }

    /// Stop processing and close the broker connection.
    pub async fn shutdown(&self) {
        self.shared.terminate();
        if let Err(error) = self.shared.channels.broker().close().await {
            warn!(%error, "broker close failed");
        }
        info!(client = %self.shared.local_name, "client stopped");
    }
}

fn broker_target(selection: &BrokerSelection) -> Result<(BrokerEndpoint, Credentials), ClientError> {
    match selection {
        BrokerSelection::Discovery(_) => Err(ClientError::DiscoveryUnresolved),
        BrokerSelection::List(entries) => {
            let entry = entries.first().ok_or(ClientError::DiscoveryUnresolved)?;
            Ok((
                BrokerEndpoint {
                    host: entry.host.clone(),
                    port: entry.port,
                },
                Credentials {
                    username: entry.username.clone(),
                    password: entry.password.clone(),
                },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generated_identity_is_a_valid_hierarchy() {
        let config = ClientConfig {
            brokers: BrokerSelection::List(vec![intersect_config::ControlPlaneConfig {
                protocol: intersect_config::BrokerProtocol::Mqtt311,
                host: "127.0.0.1".into(),
                port: 1883,
                username: "u".into(),
                password: "p".into(),
            }]),
            initial_message_event_config: ClientCallbackConfig::default(),
        };
        let hub = intersect_broker::MemoryHub::new();
        let client = IntersectClient::new(config, Arc::new(hub.client()), None, None).unwrap();
        let name = client.hierarchy().name();
        assert_eq!(Hierarchy::parse(&name).unwrap(), *client.hierarchy());
        assert!(client.hierarchy().reply_topic().ends_with("/reply"));
    }
}
