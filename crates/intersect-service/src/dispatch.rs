// SPDX-License-Identifier: MIT OR Apache-2.0
//! The inbound userspace pipeline.
//!
//! Envelope validation, version resolution, operation lookup, data-store
//! fetch, payload validation, handler invocation, and reply publication —
//! with every per-message failure converted into an error reply instead of
//! being raised. Handlers run inside a bounded worker slot on the blocking
//! pool; the broker's receive path never blocks here.

use intersect_core::message::payload_to_value;
use intersect_core::message::userspace::RoutingHints;
use intersect_core::{
    ContentType, DataHandler, ErrorKind, ErrorRecord, FieldErrors, Hierarchy,
    MessageValidationError, UserspaceMessage, UserspaceMessageOptions, WireErrorCode,
    resolve_peer_version,
};
use intersect_schema::{Capability, OperationError, ServiceResponse};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::datastore::{DataReference, DataStore};
use intersect_broker::{Outbound, Publisher};
use crate::pending::RequestBookkeeper;
use crate::pool::DispatchPool;

/// How many validation problems ride along on an error reply.
const MAX_REPORTED_PROBLEMS: usize = 10;
/// How many recently-seen message ids are remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 1024;

/// Which of the service's inboxes a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxKind {
    /// The request inbox (`<h>/userspace`).
    Userspace,
    /// The reply inbox (`<h>/reply`) for correlated responses.
    Reply,
}

struct SeenIds {
    order: VecDeque<Uuid>,
    set: HashSet<Uuid>,
}

impl SeenIds {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(SEEN_CAPACITY),
            set: HashSet::with_capacity(SEEN_CAPACITY),
        }
    }

    /// `true` the first time an id is seen.
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

struct DispatchInner {
    hierarchy: Hierarchy,
    local_name: String,
    capabilities: BTreeMap<String, Arc<Capability>>,
    pool: DispatchPool,
    bookkeeper: RequestBookkeeper,
    data_store: Option<Arc<dyn DataStore>>,
    publisher: Publisher,
    seen: Mutex<SeenIds>,
}

/// Routes inbound userspace messages to capability operations.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<DispatchInner>,
}

impl DispatchEngine {
    /// Assemble the engine over already-built collaborators.
    #[must_use]
    pub fn new(
        hierarchy: Hierarchy,
        capabilities: BTreeMap<String, Arc<Capability>>,
        pool: DispatchPool,
        bookkeeper: RequestBookkeeper,
        data_store: Option<Arc<dyn DataStore>>,
        publisher: Publisher,
    ) -> Self {
        let local_name = hierarchy.name();
        Self {
            inner: Arc::new(DispatchInner {
                hierarchy,
                local_name,
                capabilities,
                pool,
                bookkeeper,
                data_store,
                publisher,
                seen: Mutex::new(SeenIds::new()),
            }),
        }
    }

    /// Entry point from the channel layer. Never blocks; heavy work is
    /// handed to the worker pool.
    pub fn handle_inbound(&self, kind: InboxKind, bytes: &[u8]) {
        let inner = &self.inner;
        let message = match UserspaceMessage::deserialize_and_validate(bytes) {
            Ok(message) => message,
            Err(MessageValidationError::Malformed(reason)) => {
                info!(%reason, "dropping unparseable inbound message");
                return;
            }
            Err(MessageValidationError::Invalid(errors)) => {
                inner.reply_to_invalid(bytes, &errors);
                return;
            }
        };

        // subscriptions are scoped per service; anything else is a stray
        if message.headers.destination != inner.local_name {
            debug!(destination = %message.headers.destination, "not addressed here, ignoring");
            return;
        }

        let first = {
            let mut seen = inner.seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.first_sighting(message.message_id)
        };
        if !first {
            debug!(message_id = %message.message_id, "duplicate delivery suppressed");
            return;
        }

        if kind == InboxKind::Reply {
            // response handlers are user code; keep them off the receive path
            let task_inner = Arc::clone(inner);
            inner.pool.submit(async move {
                tokio::task::spawn_blocking(move || task_inner.route_reply(message))
                    .await
                    .ok();
            });
            return;
        }

        if !resolve_peer_version(&message.headers.sdk_version, &message.headers.source) {
            inner.send_error_reply(
                &message,
                WireErrorCode::VersionIncompat,
                format!(
                    "peer SDK {} is incompatible with {}",
                    message.headers.sdk_version,
                    intersect_core::version_string()
                ),
                None,
            );
            return;
        }

        let Some((capability_name, method)) = message.operation_id.split_once('.') else {
            inner.send_error_reply(
                &message,
                WireErrorCode::UnknownOperation,
                format!("malformed operation id '{}'", message.operation_id),
                None,
            );
            return;
        };
        let Some(capability) = inner.capabilities.get(capability_name) else {
            inner.send_error_reply(
                &message,
                WireErrorCode::UnknownOperation,
                format!("no capability '{capability_name}'"),
                None,
            );
            return;
        };
        if capability.operation(method).is_none() {
            inner.send_error_reply(
                &message,
                WireErrorCode::UnknownOperation,
                format!("capability '{capability_name}' has no operation '{method}'"),
                None,
            );
            return;
        }

        let task_inner = Arc::clone(inner);
        let capability = Arc::clone(capability);
        let method = method.to_string();
        inner.pool.submit(async move {
            task_inner.process(capability, method, message).await;
        });
    }

    /// Number of dispatches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.pool.in_flight()
    }
}

impl DispatchInner {
    /// Step 1 failure path: answer an invalid envelope if the sender is
    /// recoverable, otherwise drop.
    fn reply_to_invalid(&self, bytes: &[u8], errors: &FieldErrors) {
        info!(%errors, "inbound message failed validation");
        let hints = RoutingHints::peek(bytes);
        let (Some(message_id), Some(source)) = (hints.message_id, hints.source.clone()) else {
            info!("sender unrecoverable, dropping invalid message");
            return;
        };
        let code = classify_validation_failure(errors);
        let detail = json!({
            "validation_errors": errors
                .errors()
                .iter()
                .take(MAX_REPORTED_PROBLEMS)
                .map(|e| json!({"path": e.path, "kind": e.kind.as_str()}))
                .collect::<Vec<_>>(),
        });
        let record = ErrorRecord::new(code, "message failed validation").with_detail(detail);
        self.publish_reply(
            &source,
            hints.operation_id.as_deref().unwrap_or("unknown"),
            ContentType::Json,
            DataHandler::Message,
            record.to_payload(),
            true,
            Some(hints.request_id.unwrap_or(message_id)),
            None,
        );
    }

    /// Correlated replies resolve pending requests instead of dispatching.
    fn route_reply(&self, message: UserspaceMessage) {
        let Some(request_id) = message.headers.request_id else {
            debug!(message_id = %message.message_id, "reply without request id, dropping");
            return;
        };
        let payload = payload_to_value(message.content_type, &message.payload).unwrap_or(Value::Null);
        let response = ServiceResponse {
            source: message.headers.source.clone(),
            operation: message.operation_id.clone(),
            has_error: message.headers.has_error,
            payload,
        };
        if !self.bookkeeper.resolve(&request_id, response) {
            debug!(%request_id, "reply matched no pending request");
        }
    }

    /// Steps 4–9, inside a worker slot.
    async fn process(self: Arc<Self>, capability: Arc<Capability>, method: String, message: UserspaceMessage) {
        let mut payload = message.payload.clone();

        if message.headers.data_handler == DataHandler::Minio {
            let Some(store) = &self.data_store else {
                self.send_error_reply(
                    &message,
                    WireErrorCode::DataFetchFailed,
                    "no data store configured".to_string(),
                    None,
                );
                return;
            };
            let reference: DataReference = match serde_json::from_slice(&payload) {
                Ok(reference) => reference,
                Err(error) => {
                    self.send_error_reply(
                        &message,
                        WireErrorCode::DataFetchFailed,
                        format!("payload is not a data reference: {error}"),
                        None,
                    );
                    return;
                }
            };
            payload = match store.fetch(&reference).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(%error, "data store fetch failed");
                    self.send_error_reply(
                        &message,
                        WireErrorCode::DataFetchFailed,
                        error.to_string(),
                        None,
                    );
                    return;
                }
            };
        }

        let value = match payload_to_value(message.content_type, &payload) {
            Some(value) => value,
            None => {
                info!(operation = %message.operation_id, "request payload unparseable");
                self.send_error_reply(
                    &message,
                    WireErrorCode::RequestValidationFailed,
                    "request payload is not valid for its content type".to_string(),
                    None,
                );
                return;
            }
        };

        let Some(operation) = capability.operation(&method) else {
            return;
        };
        if let Err(problems) = operation.validate_request(&value) {
            info!(operation = %message.operation_id, ?problems, "request failed schema validation");
            let detail = json!({
                "validation_errors": problems
                    .iter()
                    .take(MAX_REPORTED_PROBLEMS)
                    .collect::<Vec<_>>(),
            });
            self.send_error_reply(
                &message,
                WireErrorCode::RequestValidationFailed,
                "request failed schema validation".to_string(),
                Some(detail),
            );
            return;
        }
        let response_content_type = operation.descriptor().response_content_type;
        let response_data_handler = operation.descriptor().response_data_handler;

        // user code may block; give it a blocking thread
        let context = capability.context_for(&method);
        let worker_capability = Arc::clone(&capability);
        let worker_method = method.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let Some(operation) = worker_capability.operation(&worker_method) else {
                return Err(OperationError::Handler("operation not found".to_string()));
            };
            operation.invoke(&context, value)
        })
        .await;

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_error) => Err(OperationError::Handler(format!(
                "handler panicked: {join_error}"
            ))),
        };

        match outcome {
            Err(OperationError::RequestDeserialization(reason)) => {
                info!(operation = %message.operation_id, %reason, "request deserialization failed");
                self.send_error_reply(
                    &message,
                    WireErrorCode::RequestValidationFailed,
                    reason,
                    None,
                );
            }
            Err(OperationError::Handler(reason)) => {
                warn!(operation = %message.operation_id, %reason, "handler failed");
                self.send_error_reply(&message, WireErrorCode::HandlerError, reason, None);
            }
            Err(OperationError::ResponseSerialization(reason)) => {
                error!(operation = %message.operation_id, %reason, "response serialization failed");
                self.send_error_reply(
                    &message,
                    WireErrorCode::ResponseSerializationFailed,
                    reason,
                    None,
                );
            }
            Ok(None) => {
                debug!(operation = %message.operation_id, "void operation, no reply");
            }
            Ok(Some(mut reply_payload)) => {
                if response_data_handler == DataHandler::Minio {
                    let Some(store) = &self.data_store else {
                        self.send_error_reply(
                            &message,
                            WireErrorCode::DataStoreFailed,
                            "no data store configured".to_string(),
                            None,
                        );
                        return;
                    };
                    match store.store(&reply_payload).await {
                        Ok(reference) => match serde_json::to_vec(&reference) {
                            Ok(bytes) => reply_payload = bytes,
                            Err(error) => {
                                error!(%error, "reference serialization failed");
                                self.send_error_reply(
                                    &message,
                                    WireErrorCode::DataStoreFailed,
                                    error.to_string(),
                                    None,
                                );
                                return;
                            }
                        },
                        Err(error) => {
                            error!(%error, "data store write failed");
                            self.send_error_reply(
                                &message,
                                WireErrorCode::DataStoreFailed,
                                error.to_string(),
                                None,
                            );
                            return;
                        }
                    }
                }
                self.publish_reply(
                    &message.headers.source,
                    &message.operation_id,
                    response_content_type,
                    response_data_handler,
                    reply_payload,
                    false,
                    Some(message.headers.request_id.unwrap_or(message.message_id)),
                    message.headers.campaign_id,
                );
            }
        }
    }

    fn send_error_reply(
        &self,
        message: &UserspaceMessage,
        code: WireErrorCode,
        reason: String,
        detail: Option<Value>,
    ) {
        let mut record = ErrorRecord::new(code, reason);
        if let Some(detail) = detail {
            record = record.with_detail(detail);
        }
        self.publish_reply(
            &message.headers.source,
            &message.operation_id,
            ContentType::Json,
            DataHandler::Message,
            record.to_payload(),
            true,
            Some(message.headers.request_id.unwrap_or(message.message_id)),
            message.headers.campaign_id,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_reply(
        &self,
        to_source: &str,
        operation_id: &str,
        content_type: ContentType,
        data_handler: DataHandler,
        payload: Vec<u8>,
        has_error: bool,
        request_id: Option<Uuid>,
        campaign_id: Option<Uuid>,
    ) {
        let Ok(destination) = Hierarchy::parse(to_source) else {
            warn!(source = to_source, "reply destination is not a hierarchy, dropping reply");
            return;
        };
        let reply = UserspaceMessage::create(
            self.hierarchy.name(),
            to_source,
            operation_id,
            payload,
            UserspaceMessageOptions {
                content_type,
                data_handler,
                has_error,
                request_id,
                campaign_id,
                ..UserspaceMessageOptions::default()
            },
        );
        match reply.serialize() {
            Ok(bytes) => self.publisher.send(Outbound {
                topic: destination.reply_topic(),
                payload: bytes,
                headers: BTreeMap::from([("source".to_string(), self.local_name.clone())]),
                content_type: content_type.mime().to_string(),
            }),
            Err(error) => error!(%error, "reply envelope serialization failed"),
        }
    }
}

/// Unknown enum values and malformed versions are version problems per the
/// compatibility rules; everything else is a validation failure.
fn classify_validation_failure(errors: &FieldErrors) -> WireErrorCode {
    let version_suspect = errors.errors().iter().any(|e| {
        (e.path == "contentType" && e.kind == ErrorKind::Enum)
            || (e.path == "headers.data_handler" && e.kind == ErrorKind::Enum)
            || (e.path == "headers.sdk_version" && e.kind == ErrorKind::StringPatternMismatch)
    });
    if version_suspect {
        WireErrorCode::VersionIncompat
    } else {
        WireErrorCode::RequestValidationFailed
    }
}
