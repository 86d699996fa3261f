// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifecycle messages: the control plane's startup/shutdown/status/schema
//! traffic. Lifecycle payloads are always JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::MessageEncodeError;
use crate::validation::{
    ErrorKind, FieldErrors, MessageValidationError, optional_str, parse_created_at,
    reject_unknown_keys, require_str, require_uuid, valid_source,
};
use crate::version::{is_strict_semver, version_string};

const ENVELOPE_KEYS: &[&str] = &["messageId", "contentType", "payload", "headers"];
const HEADER_KEYS: &[&str] = &["source", "destination", "sdk_version", "created_at", "lifecycle_type"];

/// Discriminates the control-plane message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LifecycleType {
    /// Service came online; payload carries the schema document.
    Startup,
    /// Service is going offline cleanly.
    Shutdown,
    /// Periodic status probe result.
    Status,
    /// A peer asks for this service's schema document.
    SchemaRequest,
    /// Reply to [`SchemaRequest`](Self::SchemaRequest) carrying the schema.
    SchemaResponse,
}

impl LifecycleType {
    /// Numeric wire form.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Startup => 0,
            Self::Shutdown => 1,
            Self::Status => 2,
            Self::SchemaRequest => 3,
            Self::SchemaResponse => 4,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Startup),
            1 => Some(Self::Shutdown),
            2 => Some(Self::Status),
            3 => Some(Self::SchemaRequest),
            4 => Some(Self::SchemaResponse),
            _ => None,
        }
    }
}

impl From<LifecycleType> for u8 {
    fn from(value: LifecycleType) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for LifecycleType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_code(i64::from(value)).ok_or_else(|| format!("unknown lifecycle type {value}"))
    }
}

/// Validated headers of a [`LifecycleMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleHeaders {
    /// Hierarchy name of the sender.
    pub source: String,
    /// Addressed service, absent for broadcasts (status, startup).
    pub destination: Option<String>,
    /// Strict `MAJOR.MINOR.PATCH` version the sender speaks.
    pub sdk_version: String,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Control-plane message kind.
    pub lifecycle_type: LifecycleType,
}

/// A control-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleMessage {
    /// Unique id of this message (UUIDv4).
    pub message_id: Uuid,
    /// JSON payload bytes (schema document, status value, or `null`).
    pub payload: Vec<u8>,
    /// Validated headers.
    pub headers: LifecycleHeaders,
}

impl LifecycleMessage {
    /// Create a new lifecycle message stamped with this SDK's identity.
    #[must_use]
    pub fn create(
        source: impl Into<String>,
        destination: Option<String>,
        lifecycle_type: LifecycleType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            payload,
            headers: LifecycleHeaders {
                source: source.into(),
                destination,
                sdk_version: version_string().to_string(),
                created_at: Utc::now(),
                lifecycle_type,
            },
        }
    }

    /// Encode to the canonical JSON envelope (content type pinned to JSON).
    ///
    /// # Errors
    ///
    /// Returns [`MessageEncodeError`] when the payload is not UTF-8.
    pub fn serialize(&self) -> Result<Vec<u8>, MessageEncodeError> {
        let payload = std::str::from_utf8(&self.payload).map_err(|_| {
            MessageEncodeError::NonUtf8Payload {
                content_type: crate::ContentType::Json,
            }
        })?;
        let mut headers = json!({
            "source": self.headers.source,
            "sdk_version": self.headers.sdk_version,
            "created_at": self
                .headers
                .created_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            "lifecycle_type": self.headers.lifecycle_type.code(),
        });
        if let (Some(map), Some(destination)) =
            (headers.as_object_mut(), &self.headers.destination)
        {
            map.insert("destination".into(), json!(destination));
        }
        let envelope = json!({
            "messageId": self.message_id.to_string(),
            "contentType": "application/json",
            "payload": payload,
            "headers": headers,
        });
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode and validate an inbound lifecycle envelope.
    ///
    /// # Errors
    ///
    /// [`MessageValidationError`] listing every field problem.
    pub fn deserialize_and_validate(bytes: &[u8]) -> Result<Self, MessageValidationError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let mut errors = FieldErrors::new();
        let Some(envelope) = value.as_object() else {
            errors.push("", ErrorKind::Missing);
            return Err(MessageValidationError::Invalid(errors));
        };
        reject_unknown_keys(envelope, ENVELOPE_KEYS, "", &mut errors);

        let message_id = require_uuid(envelope, "messageId", "", &mut errors);
        // lifecycle traffic is always JSON; any other literal is an error
        if let Some(raw) = optional_str(envelope, "contentType", "", &mut errors) {
            if raw != "application/json" {
                errors.push("contentType", ErrorKind::LiteralError);
            }
        }
        let payload =
            require_str(envelope, "payload", "", &mut errors).map(|s| s.as_bytes().to_vec());

        let headers = match envelope.get("headers") {
            None | Some(Value::Null) => {
                errors.push("headers", ErrorKind::Missing);
                None
            }
            Some(Value::Object(map)) => validate_headers(map, &mut errors),
            Some(_) => {
                errors.push("headers", ErrorKind::Missing);
                None
            }
        };

        match (message_id, payload, headers) {
            (Some(message_id), Some(payload), Some(headers)) if errors.is_empty() => Ok(Self {
                message_id,
                payload,
                headers,
            }),
            _ => Err(MessageValidationError::Invalid(errors)),
        }
    }
}

fn validate_headers(map: &Map<String, Value>, errors: &mut FieldErrors) -> Option<LifecycleHeaders> {
    reject_unknown_keys(map, HEADER_KEYS, "headers", errors);

    let source = require_str(map, "source", "headers", errors).and_then(|s| {
        if valid_source(s) {
            Some(s.to_string())
        } else {
            errors.push("headers.source", ErrorKind::StringPatternMismatch);
            None
        }
    });
    let destination = optional_str(map, "destination", "headers", errors).and_then(|s| {
        if valid_source(s) {
            Some(s.to_string())
        } else {
            errors.push("headers.destination", ErrorKind::StringPatternMismatch);
            None
        }
    });
    let sdk_version = require_str(map, "sdk_version", "headers", errors).and_then(|s| {
        if is_strict_semver(s) {
            Some(s.to_string())
        } else {
            errors.push("headers.sdk_version", ErrorKind::StringPatternMismatch);
            None
        }
    });
    let created_at = match map.get("created_at") {
        None | Some(Value::Null) => {
            errors.push("headers.created_at", ErrorKind::Missing);
            None
        }
        Some(value) => parse_created_at(value, "headers.created_at", errors),
    };
    let lifecycle_type = match map.get("lifecycle_type") {
        None | Some(Value::Null) => {
            errors.push("headers.lifecycle_type", ErrorKind::Missing);
            None
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(LifecycleType::from_code)
            .or_else(|| {
                errors.push("headers.lifecycle_type", ErrorKind::Enum);
                None
            }),
        Some(_) => {
            errors.push("headers.lifecycle_type", ErrorKind::Enum);
            None
        }
    };

    Some(LifecycleHeaders {
        source: source?,
        destination,
        sdk_version: sdk_version?,
        created_at: created_at?,
        lifecycle_type: lifecycle_type?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_message_deserializes() {
        let serialized = br#"{"messageId":"cc88a2c9-7e47-409f-82c5-ef49914ae140","contentType":"application/json","payload":"payload","headers":{"source":"source","destination":"destination","sdk_version":"0.5.0","created_at":"2024-01-19T20:21:14.045591Z","lifecycle_type":0}}"#;
        let msg = LifecycleMessage::deserialize_and_validate(serialized).unwrap();
        assert_eq!(msg.headers.lifecycle_type, LifecycleType::Startup);
        assert_eq!(msg.headers.destination.as_deref(), Some("destination"));
    }

    #[test]
    fn missing_fields_all_reported() {
        let err = LifecycleMessage::deserialize_and_validate(b"{}").unwrap_err();
        let errors = err.field_errors().unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains("messageId", ErrorKind::Missing));
        assert!(errors.contains("payload", ErrorKind::Missing));
        assert!(errors.contains("headers", ErrorKind::Missing));
    }

    #[test]
    fn missing_header_fields_all_reported() {
        let serialized = br#"{"messageId":"cc88a2c9-7e47-409f-82c5-ef49914ae140","contentType":"application/json","payload":"payload","headers":{}}"#;
        let err = LifecycleMessage::deserialize_and_validate(serialized).unwrap_err();
        let errors = err.field_errors().unwrap();
        assert_eq!(errors.len(), 4);
        for key in [
            "headers.source",
            "headers.sdk_version",
            "headers.created_at",
            "headers.lifecycle_type",
        ] {
            assert!(errors.contains(key, ErrorKind::Missing), "{key}");
        }
    }

    #[test]
    fn invalid_fields_all_reported() {
        let serialized = br#"{"messageId":"notauuid","contentType":"doesnotexist","payload":"payload","headers":{"source":"/","destination":"/","sdk_version":"1.0.0+20130313144700","created_at":"2024-01-19T20:21:14.045591","lifecycle_type":-1}}"#;
        let err = LifecycleMessage::deserialize_and_validate(serialized).unwrap_err();
        let errors = err.field_errors().unwrap();
        assert_eq!(errors.len(), 7);
        assert!(errors.contains("messageId", ErrorKind::UuidParsing));
        assert!(errors.contains("contentType", ErrorKind::LiteralError));
        assert!(errors.contains("headers.source", ErrorKind::StringPatternMismatch));
        assert!(errors.contains("headers.destination", ErrorKind::StringPatternMismatch));
        assert!(errors.contains("headers.sdk_version", ErrorKind::StringPatternMismatch));
        assert!(errors.contains("headers.created_at", ErrorKind::TimezoneAware));
        assert!(errors.contains("headers.lifecycle_type", ErrorKind::Enum));
    }

    #[test]
    fn create_and_round_trip() {
        let msg = LifecycleMessage::create(
            "source",
            Some("destination".to_string()),
            LifecycleType::Shutdown,
            b"[1,2,3]".to_vec(),
        );
        assert_eq!(msg.message_id.get_version_num(), 4);
        assert_eq!(msg.headers.sdk_version, version_string());
        let bytes = msg.serialize().unwrap();
        let back = LifecycleMessage::deserialize_and_validate(&bytes).unwrap();
        assert_eq!(back.headers.lifecycle_type, LifecycleType::Shutdown);
        assert_eq!(back.payload, b"[1,2,3]");
    }

    #[test]
    fn status_broadcast_has_no_destination() {
        let msg = LifecycleMessage::create("source", None, LifecycleType::Status, b"{}".to_vec());
        let bytes = msg.serialize().unwrap();
        let back = LifecycleMessage::deserialize_and_validate(&bytes).unwrap();
        assert_eq!(back.headers.destination, None);
    }
}
