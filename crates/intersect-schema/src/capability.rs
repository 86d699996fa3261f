// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built capabilities, operation invocation, and the service back-channel.
//!
//! A [`Capability`] never owns the service hosting it. The service installs
//! a [`CapabilityObserver`] as a weak reference at registration time; event
//! emission and service-to-service calls flow through that observer.

use intersect_core::{ContentType, DataHandler};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::descriptor::{CapabilityDescriptor, OperationDescriptor};

/// What user handlers return: a value or any error, which dispatch converts
/// into a `HANDLER_ERROR` reply.
pub type HandlerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Parameters of a service-to-service (or client-to-service) request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DirectMessageParams {
    /// Dotted hierarchy name of the target service.
    pub destination: String,
    /// `CapabilityName.method_name` to invoke.
    pub operation: String,
    /// Request payload as a JSON value.
    pub payload: Value,
    /// Content type of the payload. Defaults to JSON.
    #[serde(default)]
    pub content_type: ContentType,
    /// Inline vs object-store payload. Defaults to inline.
    #[serde(default)]
    pub data_handler: DataHandler,
}

impl DirectMessageParams {
    /// Convenience constructor with JSON content and inline payload.
    #[must_use]
    pub fn new(destination: impl Into<String>, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            destination: destination.into(),
            operation: operation.into(),
            payload,
            content_type: ContentType::Json,
            data_handler: DataHandler::Message,
        }
    }
}

/// A decoded reply to a tracked request.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    /// Hierarchy name of the responding service.
    pub source: String,
    /// Operation id the reply answers.
    pub operation: String,
    /// `true` when `payload` is an error record.
    pub has_error: bool,
    /// Reply payload as a JSON value.
    pub payload: Value,
}

/// Callback invoked exactly once with the reply to a tracked request.
pub type ResponseHandler = Box<dyn FnOnce(ServiceResponse) + Send + 'static>;

/// The service-side surface a capability reaches back into.
///
/// Installed by the owning service when the capability is registered; the
/// capability holds it weakly so no ownership cycle forms.
pub trait CapabilityObserver: Send + Sync {
    /// An operation handler emitted an event.
    fn observe_event(&self, capability_name: &str, operation: &str, event_name: &str, value: Value);

    /// An operation handler started a request to another service.
    /// Returns the correlation id under which the request is tracked.
    fn create_external_request(
        &self,
        request: DirectMessageParams,
        response_handler: Option<ResponseHandler>,
        timeout: Duration,
    ) -> Uuid;
}

/// Per-invocation handle handed to operation handlers.
///
/// Carries the emitting operation's identity so event emission can be
/// checked against the operation's declared event set. Cloning is cheap;
/// clone into a response callback to emit events from there under the
/// originating operation's declared set.
#[derive(Clone)]
pub struct OperationContext {
    observer: Weak<dyn CapabilityObserver>,
    capability_name: String,
    operation: String,
}

impl OperationContext {
    pub(crate) fn new(
        observer: Weak<dyn CapabilityObserver>,
        capability_name: String,
        operation: String,
    ) -> Self {
        Self {
            observer,
            capability_name,
            operation,
        }
    }

    /// Name of the capability this invocation belongs to.
    #[must_use]
    pub fn capability_name(&self) -> &str {
        &self.capability_name
    }

    /// Method name of the running operation.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Emit an event from inside a handler.
    ///
    /// Never fails into the handler: serialization problems and missing
    /// observers log a warning and drop the event.
    pub fn emit_event<T: Serialize>(&self, event_name: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    capability = %self.capability_name,
                    event = event_name,
                    %error,
                    "event payload not serializable, dropping"
                );
                return;
            }
        };
        match self.observer.upgrade() {
            Some(observer) => {
                observer.observe_event(&self.capability_name, &self.operation, event_name, value);
            }
            None => warn!(
                capability = %self.capability_name,
                event = event_name,
                "no observer installed, dropping event"
            ),
        }
    }

    /// Start a request to another service from inside a handler.
    ///
    /// Returns the correlation id, or `None` when no observer is installed
    /// (the capability is not registered with a running service).
    pub fn call_service(
        &self,
        request: DirectMessageParams,
        response_handler: Option<ResponseHandler>,
        timeout: Duration,
    ) -> Option<Uuid> {
        match self.observer.upgrade() {
            Some(observer) => {
                Some(observer.create_external_request(request, response_handler, timeout))
            }
            None => {
                warn!(
                    capability = %self.capability_name,
                    operation = %self.operation,
                    "no observer installed, dropping external request"
                );
                None
            }
        }
    }
}

/// Failure classes of an operation invocation, mapped by dispatch onto the
/// wire error codes.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The payload did not deserialize into the request type.
    #[error("request deserialization failed: {0}")]
    RequestDeserialization(String),

    /// The user handler returned an error.
    #[error("{0}")]
    Handler(String),

    /// The handler's return value did not serialize as the response type.
    #[error("response serialization failed: {0}")]
    ResponseSerialization(String),
}

/// Type-erased operation handler: JSON request value in, serialized
/// response bytes out (`None` for void operations).
pub type RawOperationHandler =
    Arc<dyn Fn(&OperationContext, Value) -> Result<Option<Vec<u8>>, OperationError> + Send + Sync>;

/// Type-erased status probe.
pub type RawStatusHandler = Arc<dyn Fn() -> Result<Vec<u8>, OperationError> + Send + Sync>;

/// A registered, invocable operation.
pub struct Operation {
    pub(crate) descriptor: OperationDescriptor,
    pub(crate) handler: RawOperationHandler,
    pub(crate) validator: Option<jsonschema::Validator>,
}

impl Operation {
    /// The frozen descriptor of this operation.
    #[must_use]
    pub fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    /// Validate a request payload against the request schema.
    ///
    /// # Errors
    ///
    /// Returns the validation problems as display strings (instance path
    /// prefixed), capped by the caller.
    pub fn validate_request(&self, payload: &Value) -> Result<(), Vec<String>> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let mut problems: Vec<String> = validator
            .iter_errors(payload)
            .map(|error| format!("{}: {error}", error.instance_path))
            .collect();
        if self.descriptor.strict_request_validation {
            problems.extend(unknown_field_problems(
                self.descriptor.request_type.as_ref(),
                payload,
            ));
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }

    /// Run the handler with an already-validated request value.
    ///
    /// # Errors
    ///
    /// [`OperationError`] classifying the failure for the error reply.
    pub fn invoke(
        &self,
        context: &OperationContext,
        payload: Value,
    ) -> Result<Option<Vec<u8>>, OperationError> {
        (self.handler)(context, payload)
    }
}

/// Strict mode: reject unknown top-level object fields unless the schema
/// explicitly allows additional properties.
fn unknown_field_problems(schema: Option<&Value>, payload: &Value) -> Vec<String> {
    let (Some(schema), Some(object)) = (schema, payload.as_object()) else {
        return Vec::new();
    };
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    if schema.get("additionalProperties") == Some(&Value::Bool(true)) {
        return Vec::new();
    }
    object
        .keys()
        .filter(|key| !properties.contains_key(*key))
        .map(|key| format!("/{key}: unknown field"))
        .collect()
}

/// A built, immutable capability ready for registration with a service.
pub struct Capability {
    pub(crate) descriptor: CapabilityDescriptor,
    pub(crate) status_handler: RawStatusHandler,
    pub(crate) operations: BTreeMap<String, Operation>,
    pub(crate) event_validators: BTreeMap<String, jsonschema::Validator>,
    observer: OnceLock<Weak<dyn CapabilityObserver>>,
}

impl Capability {
    pub(crate) fn assemble(
        descriptor: CapabilityDescriptor,
        status_handler: RawStatusHandler,
        operations: BTreeMap<String, Operation>,
        event_validators: BTreeMap<String, jsonschema::Validator>,
    ) -> Self {
        Self {
            descriptor,
            status_handler,
            operations,
            event_validators,
            observer: OnceLock::new(),
        }
    }

    /// The capability's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.capability_name
    }

    /// The frozen descriptor tables.
    #[must_use]
    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Install the owning service's observer. Only the first installation
    /// wins; later calls are ignored with a warning.
    pub fn register_observer(&self, observer: Weak<dyn CapabilityObserver>) {
        if self.observer.set(observer).is_err() {
            warn!(capability = %self.name(), "observer already installed, ignoring");
        }
    }

    /// Look up an operation by method name.
    #[must_use]
    pub fn operation(&self, method_name: &str) -> Option<&Operation> {
        self.operations.get(method_name)
    }

    /// Iterate all registered operations.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    /// Build the per-invocation context for an operation of this capability.
    #[must_use]
    pub fn context_for(&self, operation: &str) -> OperationContext {
        let observer: Weak<dyn CapabilityObserver> = match self.observer.get() {
            Some(observer) => observer.clone(),
            None => Weak::<Detached>::new(),
        };
        OperationContext::new(observer, self.name().to_string(), operation.to_string())
    }

    /// Run the status probe and serialize its value.
    ///
    /// # Errors
    ///
    /// [`OperationError::ResponseSerialization`] when the status value does
    /// not serialize.
    pub fn status_payload(&self) -> Result<Vec<u8>, OperationError> {
        (self.status_handler)()
    }

    /// Validate an emitted event value against the event's declared schema.
    ///
    /// # Errors
    ///
    /// A display string describing the first mismatch, or a note that the
    /// event is undeclared.
    pub fn validate_event(&self, event_name: &str, value: &Value) -> Result<(), String> {
        let Some(validator) = self.event_validators.get(event_name) else {
            return Err(format!("event '{event_name}' is not declared"));
        };
        match validator.validate(value) {
            Ok(()) => Ok(()),
            Err(error) => Err(error.to_string()),
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("capability_name", &self.descriptor.capability_name)
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field("events", &self.descriptor.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Stand-in observer target for capabilities not yet registered.
struct Detached;

impl CapabilityObserver for Detached {
    fn observe_event(&self, _: &str, _: &str, _: &str, _: Value) {}

    fn create_external_request(
        &self,
        _: DirectMessageParams,
        _: Option<ResponseHandler>,
        _: Duration,
    ) -> Uuid {
        Uuid::nil()
    }
}
