// SPDX-License-Identifier: MIT OR Apache-2.0
//! Emit-time checked event publication.
//!
//! Emission never fails back into the handler: every violation logs and
//! drops. A single forwarding task serializes store-then-publish, so
//! events emitted by one invocation reach the broker in emit order.

use intersect_core::{DataHandler, EventMessage, Hierarchy};
use intersect_schema::Capability;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::datastore::DataStore;
use intersect_broker::{Outbound, Publisher};

struct EmitJob {
    capability_name: String,
    event_name: String,
    content_type: intersect_core::ContentType,
    data_handler: DataHandler,
    payload: Vec<u8>,
}

/// Publishes capability events once the service is READY.
#[derive(Clone)]
pub struct EventEmitter {
    hierarchy: Hierarchy,
    ready: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<EmitJob>,
}

impl EventEmitter {
    /// Spawn the forwarding task and return the emitter handle.
    ///
    /// `ready` is the READY gate shared with the lifecycle controller;
    /// nothing publishes while it is down.
    #[must_use]
    pub fn start(
        hierarchy: Hierarchy,
        publisher: Publisher,
        data_store: Option<Arc<dyn DataStore>>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EmitJob>();
        let source = hierarchy.name();
        let topic_hierarchy = hierarchy.clone();
        tokio::spawn(async move {
            while let Some(mut job) = rx.recv().await {
                if job.data_handler == DataHandler::Minio {
                    let Some(store) = &data_store else {
                        warn!(event = %job.event_name, "no data store configured, dropping event");
                        continue;
                    };
                    match store.store(&job.payload).await {
                        Ok(reference) => match serde_json::to_vec(&reference) {
                            Ok(bytes) => job.payload = bytes,
                            Err(error) => {
                                warn!(event = %job.event_name, %error, "reference serialization failed, dropping event");
                                continue;
                            }
                        },
                        Err(error) => {
                            warn!(event = %job.event_name, %error, "data store write failed, dropping event");
                            continue;
                        }
                    }
                }
                let message = EventMessage::create(
                    source.clone(),
                    job.capability_name.clone(),
                    job.event_name.clone(),
                    job.content_type,
                    job.data_handler,
                    job.payload,
                );
                let headers = message.headers.to_header_map();
                match message.serialize() {
                    Ok(bytes) => {
                        let topic =
                            topic_hierarchy.event_topic(&job.capability_name, &job.event_name);
                        publisher.send(Outbound {
                            topic,
                            payload: bytes,
                            headers,
                            content_type: job.content_type.mime().to_string(),
                        });
                    }
                    Err(error) => {
                        warn!(event = %job.event_name, %error, "event envelope serialization failed")
                    }
                }
            }
        });
        Self {
            hierarchy,
            ready,
            tx,
        }
    }

    /// Hierarchy events are published under.
    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Emit `event_name` with `value` on behalf of `operation`.
    ///
    /// Checks, in order: the service is READY, the event is declared on the
    /// capability, the emitting operation declared it, and the value
    /// matches the event schema. Violations log a warning and drop.
    pub fn emit(&self, capability: &Capability, operation: &str, event_name: &str, value: &Value) {
        if !self.ready.load(Ordering::SeqCst) {
            warn!(event = event_name, "service not ready, dropping event");
            return;
        }
        let Some(definition) = capability.descriptor().events.get(event_name) else {
            warn!(
                capability = %capability.name(),
                event = event_name,
                "undeclared event, dropping"
            );
            return;
        };
        match capability.operation(operation) {
            Some(op) if op.descriptor().events_emitted.contains(event_name) => {}
            Some(_) => {
                warn!(
                    capability = %capability.name(),
                    operation,
                    event = event_name,
                    "operation did not declare this event, dropping"
                );
                return;
            }
            None => {
                warn!(
                    capability = %capability.name(),
                    operation,
                    event = event_name,
                    "emission outside a registered operation, dropping"
                );
                return;
            }
        }
        if let Err(reason) = capability.validate_event(event_name, value) {
            warn!(
                capability = %capability.name(),
                event = event_name,
                reason,
                "event value failed its schema, dropping"
            );
            return;
        }

        let payload = match definition.content_type {
            intersect_core::ContentType::Text => match value.as_str() {
                Some(text) => text.as_bytes().to_vec(),
                None => {
                    warn!(event = event_name, "text event value is not a string, dropping");
                    return;
                }
            },
            _ => match serde_json::to_vec(value) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(event = event_name, %error, "event serialization failed, dropping");
                    return;
                }
            },
        };
        let job = EmitJob {
            capability_name: capability.name().to_string(),
            event_name: event_name.to_string(),
            content_type: definition.content_type,
            data_handler: definition.data_handler,
            payload,
        };
        if self.tx.send(job).is_err() {
            debug!("emitter stopped, dropping event");
        }
    }
}
