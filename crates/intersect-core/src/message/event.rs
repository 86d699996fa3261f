// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event messages: unsolicited, broadcast capability events.
//!
//! Event headers are a flat string→string map so they can ride native
//! broker header properties (MQTT 5 user properties, AMQP header tables);
//! `data_handler` is therefore spelled as the enum name rather than the
//! numeric form used by the other envelopes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{MessageEncodeError, decode_payload, encode_payload};
use crate::content::{ContentType, DataHandler};
use crate::validation::{
    ErrorKind, FieldErrors, MessageValidationError, parse_created_at, valid_simple_name,
    valid_source,
};
use crate::version::{is_strict_semver, version_string};

/// Validated headers of an [`EventMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeaders {
    /// Unique id of this message (UUIDv4).
    pub message_id: Uuid,
    /// Hierarchy name of the emitting service.
    pub source: String,
    /// Strict `MAJOR.MINOR.PATCH` version the emitter speaks.
    pub sdk_version: String,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Inline payload vs object-store reference.
    pub data_handler: DataHandler,
    /// Capability that declared the event.
    pub capability_name: String,
    /// Name of the event.
    pub event_name: String,
}

impl EventHeaders {
    /// Create headers with a fresh UUIDv4 id, the current UTC time, and
    /// this SDK's version.
    #[must_use]
    pub fn create(
        source: impl Into<String>,
        data_handler: DataHandler,
        capability_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            source: source.into(),
            sdk_version: version_string().to_string(),
            created_at: Utc::now(),
            data_handler,
            capability_name: capability_name.into(),
            event_name: event_name.into(),
        }
    }

    /// Render as a string→string map suitable for broker header properties.
    #[must_use]
    pub fn to_header_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("message_id".to_string(), self.message_id.to_string()),
            ("source".to_string(), self.source.clone()),
            ("sdk_version".to_string(), self.sdk_version.clone()),
            (
                "created_at".to_string(),
                self.created_at.to_rfc3339_opts(SecondsFormat::Micros, false),
            ),
            ("data_handler".to_string(), self.data_handler.name().to_string()),
            ("capability_name".to_string(), self.capability_name.clone()),
            ("event_name".to_string(), self.event_name.clone()),
        ])
    }

    /// Validate a raw header map, collecting every field problem.
    ///
    /// `data_handler` defaults to `MESSAGE` when absent.
    ///
    /// # Errors
    ///
    /// [`MessageValidationError::Invalid`] listing `{path, kind}` pairs.
    pub fn from_header_map(
        map: &BTreeMap<String, String>,
    ) -> Result<Self, MessageValidationError> {
        let mut errors = FieldErrors::new();

        let message_id = match map.get("message_id") {
            None => {
                errors.push("message_id", ErrorKind::Missing);
                None
            }
            Some(raw) => Uuid::parse_str(raw)
                .inspect_err(|_| errors.push("message_id", ErrorKind::UuidParsing))
                .ok(),
        };
        let source = require_pattern(map, "source", valid_source, &mut errors);
        let sdk_version = require_pattern(map, "sdk_version", is_strict_semver, &mut errors);
        let created_at = match map.get("created_at") {
            None => {
                errors.push("created_at", ErrorKind::Missing);
                None
            }
            Some(raw) => parse_created_at(&Value::String(raw.clone()), "created_at", &mut errors),
        };
        let data_handler = match map.get("data_handler") {
            None => Some(DataHandler::default()),
            Some(raw) => DataHandler::from_name(raw)
                .inspect_err(|_| errors.push("data_handler", ErrorKind::Enum))
                .ok(),
        };
        let capability_name = require_pattern(map, "capability_name", valid_simple_name, &mut errors);
        let event_name = require_pattern(map, "event_name", valid_simple_name, &mut errors);

        let headers = (|| {
            Some(Self {
                message_id: message_id?,
                source: source?,
                sdk_version: sdk_version?,
                created_at: created_at?,
                data_handler: data_handler?,
                capability_name: capability_name?,
                event_name: event_name?,
            })
        })();
        match headers {
            Some(headers) if errors.is_empty() => Ok(headers),
            _ => Err(MessageValidationError::Invalid(errors)),
        }
    }
}

fn require_pattern(
    map: &BTreeMap<String, String>,
    key: &str,
    pattern: fn(&str) -> bool,
    errors: &mut FieldErrors,
) -> Option<String> {
    match map.get(key) {
        None => {
            errors.push(key, ErrorKind::Missing);
            None
        }
        Some(raw) if pattern(raw) => Some(raw.clone()),
        Some(_) => {
            errors.push(key, ErrorKind::StringPatternMismatch);
            None
        }
    }
}

/// A capability event on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    /// Validated headers.
    pub headers: EventHeaders,
    /// Content type of the payload bytes.
    pub content_type: ContentType,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl EventMessage {
    /// Create a new event message stamped with this SDK's identity.
    #[must_use]
    pub fn create(
        source: impl Into<String>,
        capability_name: impl Into<String>,
        event_name: impl Into<String>,
        content_type: ContentType,
        data_handler: DataHandler,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            headers: EventHeaders::create(source, data_handler, capability_name, event_name),
            content_type,
            payload,
        }
    }

    /// Encode to the canonical JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MessageEncodeError`] when the payload cannot be embedded.
    pub fn serialize(&self) -> Result<Vec<u8>, MessageEncodeError> {
        let payload = encode_payload(self.content_type, &self.payload)?;
        let envelope = json!({
            "messageId": self.headers.message_id.to_string(),
            "contentType": self.content_type.mime(),
            "payload": payload,
            "headers": {
                "source": self.headers.source,
                "sdk_version": self.headers.sdk_version,
                "created_at": self
                    .headers
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Micros, false),
                "data_handler": self.headers.data_handler.name(),
                "capability_name": self.headers.capability_name,
                "event_name": self.headers.event_name,
            },
        });
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode and validate an inbound event envelope.
    ///
    /// # Errors
    ///
    /// [`MessageValidationError`] as for
    /// [`UserspaceMessage::deserialize_and_validate`](crate::UserspaceMessage::deserialize_and_validate).
    pub fn deserialize_and_validate(bytes: &[u8]) -> Result<Self, MessageValidationError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let mut errors = FieldErrors::new();
        let Some(envelope) = value.as_object() else {
            errors.push("", ErrorKind::Missing);
            return Err(MessageValidationError::Invalid(errors));
        };

        let content_type = match envelope.get("contentType").and_then(Value::as_str) {
            None => {
                errors.push("contentType", ErrorKind::Missing);
                None
            }
            Some(raw) => ContentType::parse(raw)
                .inspect_err(|_| errors.push("contentType", ErrorKind::Enum))
                .ok(),
        };
        let raw_payload = match envelope.get("payload").and_then(Value::as_str) {
            None => {
                errors.push("payload", ErrorKind::Missing);
                None
            }
            Some(raw) => Some(raw.to_string()),
        };

        // the envelope nests the header map minus message_id; fold it back in
        let mut header_map: BTreeMap<String, String> = BTreeMap::new();
        match envelope.get("headers").and_then(Value::as_object) {
            None => errors.push("headers", ErrorKind::Missing),
            Some(map) => {
                for (key, value) in map {
                    if let Some(s) = value.as_str() {
                        header_map.insert(key.clone(), s.to_string());
                    } else {
                        errors.push(format!("headers.{key}"), ErrorKind::StringType);
                    }
                }
            }
        }
        if let Some(raw) = envelope.get("messageId").and_then(Value::as_str) {
            header_map.insert("message_id".to_string(), raw.to_string());
        }

        let headers = match EventHeaders::from_header_map(&header_map) {
            Ok(headers) => Some(headers),
            Err(MessageValidationError::Invalid(mut nested)) => {
                for e in std::mem::take(&mut nested) {
                    errors.push(e.path, e.kind);
                }
                None
            }
            Err(MessageValidationError::Malformed(_)) => None,
        };

        let payload = match (content_type, &raw_payload) {
            (Some(ct), Some(raw)) => decode_payload(ct, raw).or_else(|| {
                errors.push("payload", ErrorKind::StringPatternMismatch);
                None
            }),
            _ => None,
        };

        match (headers, content_type, payload) {
            (Some(headers), Some(content_type), Some(payload)) if errors.is_empty() => Ok(Self {
                headers,
                content_type,
                payload,
            }),
            _ => Err(MessageValidationError::Invalid(errors)),
        }
    }
}
