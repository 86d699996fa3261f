// SPDX-License-Identifier: MIT OR Apache-2.0
//! Frozen descriptor tables and the advertised schema document.

use intersect_core::{ContentType, DataHandler};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};

/// Declaration of one event a capability may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    /// JSON schema of the event payload.
    pub event_type: Value,
    /// Content type events of this name are published with.
    pub content_type: ContentType,
    /// Inline vs object-store payload for this event.
    pub data_handler: DataHandler,
    /// Optional human-readable documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// Description of one addressable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// `CapabilityName.method_name`.
    pub operation_id: String,
    /// The method segment of the operation id.
    pub method_name: String,
    /// JSON schema of the request payload; `None` for no-argument operations.
    pub request_type: Option<Value>,
    /// JSON schema of the response payload; `None` for void operations.
    pub response_type: Option<Value>,
    /// Content type expected on requests.
    pub request_content_type: ContentType,
    /// Content type produced on responses.
    pub response_content_type: ContentType,
    /// Inline vs object-store request payloads.
    pub request_data_handler: DataHandler,
    /// Inline vs object-store response payloads.
    pub response_data_handler: DataHandler,
    /// Whether unknown request fields are rejected.
    pub strict_request_validation: bool,
    /// Events this operation is allowed to emit.
    pub events_emitted: BTreeSet<String>,
    /// Optional human-readable documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

/// The complete frozen description of one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Capability name, `[A-Za-z][A-Za-z0-9_]*`.
    pub capability_name: String,
    /// The single status operation's response schema.
    pub status_type: Value,
    /// Operations keyed by method name.
    pub operations: BTreeMap<String, OperationDescriptor>,
    /// Events keyed by event name.
    pub events: BTreeMap<String, EventDefinition>,
}

impl CapabilityDescriptor {
    /// Render the JSON-schema-like document advertised for this capability.
    #[must_use]
    pub fn schema_document(&self) -> Value {
        let operations: BTreeMap<&String, Value> = self
            .operations
            .iter()
            .map(|(name, op)| {
                (
                    name,
                    json!({
                        "operationId": op.operation_id,
                        "request": op.request_type,
                        "response": op.response_type,
                        "requestContentType": op.request_content_type.mime(),
                        "responseContentType": op.response_content_type.mime(),
                        "requestDataHandler": op.request_data_handler.code(),
                        "responseDataHandler": op.response_data_handler.code(),
                        "strictRequestValidation": op.strict_request_validation,
                        "eventsEmitted": op.events_emitted,
                        "description": op.documentation,
                    }),
                )
            })
            .collect();
        let events: BTreeMap<&String, Value> = self
            .events
            .iter()
            .map(|(name, event)| {
                (
                    name,
                    json!({
                        "eventType": event.event_type,
                        "contentType": event.content_type.mime(),
                        "dataHandler": event.data_handler.code(),
                        "description": event.documentation,
                    }),
                )
            })
            .collect();
        json!({
            "capability": self.capability_name,
            "status": self.status_type,
            "operations": operations,
            "events": events,
        })
    }
}
