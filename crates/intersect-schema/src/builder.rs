// SPDX-License-Identifier: MIT OR Apache-2.0
//! Explicit registration of operations, events, and the status probe.
//!
//! Registration never fails mid-flight; every problem is recorded and
//! surfaced together by [`CapabilityBuilder::build`], so a misdeclared
//! capability fails service startup and nothing else.

use intersect_core::{ContentType, DataHandler};
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use crate::capability::{
    Capability, Operation, OperationContext, OperationError, RawOperationHandler, RawStatusHandler,
};
use crate::descriptor::{CapabilityDescriptor, EventDefinition, OperationDescriptor};

/// Per-operation registration knobs.
#[derive(Debug, Clone)]
pub struct OperationOptions {
    /// Content type expected on requests. Defaults to JSON.
    pub request_content_type: ContentType,
    /// Content type produced on responses. Defaults to JSON.
    pub response_content_type: ContentType,
    /// Inline vs object-store request payloads.
    pub request_data_handler: DataHandler,
    /// Inline vs object-store response payloads.
    pub response_data_handler: DataHandler,
    /// Reject unknown request fields instead of ignoring them.
    pub strict_request_validation: bool,
    /// Events this operation may emit. Every name must be declared via
    /// [`CapabilityBuilder::event`].
    pub events: Vec<String>,
    /// Human-readable documentation carried into the schema document.
    pub documentation: Option<String>,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            request_content_type: ContentType::Json,
            response_content_type: ContentType::Json,
            request_data_handler: DataHandler::Message,
            response_data_handler: DataHandler::Message,
            strict_request_validation: false,
            events: Vec::new(),
            documentation: None,
        }
    }
}

impl OperationOptions {
    /// Options declaring a set of emittable events.
    #[must_use]
    pub fn with_events<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: events.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Per-event registration knobs.
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    /// Content type events of this name are published with.
    pub content_type: ContentType,
    /// Inline vs object-store payloads.
    pub data_handler: DataHandler,
    /// Human-readable documentation.
    pub documentation: Option<String>,
}

/// A capability declaration failed. Raised at service construction, never
/// at dispatch time.
#[derive(Debug, Error)]
pub enum SchemaBuildError {
    /// Capability name does not match `[A-Za-z][A-Za-z0-9_]*`.
    #[error("invalid capability name '{0}'")]
    InvalidCapabilityName(String),

    /// Operation method name does not match `[A-Za-z][A-Za-z0-9_]*`.
    #[error("{capability}: invalid operation name '{name}'")]
    InvalidOperationName {
        /// Capability being built.
        capability: String,
        /// The offending name.
        name: String,
    },

    /// Event name does not match `[A-Za-z][A-Za-z0-9_]*`.
    #[error("{capability}: invalid event name '{name}'")]
    InvalidEventName {
        /// Capability being built.
        capability: String,
        /// The offending name.
        name: String,
    },

    /// Two operations registered under the same method name.
    #[error("{capability}: duplicate operation '{name}'")]
    DuplicateOperation {
        /// Capability being built.
        capability: String,
        /// The duplicated name.
        name: String,
    },

    /// Two events registered under the same name.
    #[error("{capability}: duplicate event '{name}'")]
    DuplicateEvent {
        /// Capability being built.
        capability: String,
        /// The duplicated name.
        name: String,
    },

    /// More than one status probe registered.
    #[error("{capability}: a capability has exactly one status operation")]
    DuplicateStatus {
        /// Capability being built.
        capability: String,
    },

    /// No status probe registered.
    #[error("{capability}: missing the status operation")]
    MissingStatus {
        /// Capability being built.
        capability: String,
    },

    /// An operation declared an event that was never registered.
    #[error("{capability}: operation '{operation}' emits undeclared event '{event}'")]
    UndeclaredEvent {
        /// Capability being built.
        capability: String,
        /// Operation declaring the event.
        operation: String,
        /// The undeclared event name.
        event: String,
    },

    /// An event's payload schema is an untyped placeholder.
    #[error("{capability}: event '{event}' has a placeholder schema with no concrete type")]
    UntypedEventSchema {
        /// Capability being built.
        capability: String,
        /// The offending event.
        event: String,
    },

    /// A schema failed to compile into a validator.
    #[error("{capability}: schema for '{subject}' failed to compile: {reason}")]
    SchemaCompile {
        /// Capability being built.
        capability: String,
        /// Operation or event the schema belongs to.
        subject: String,
        /// Compiler diagnostic.
        reason: String,
    },

    /// Several of the above.
    #[error("capability declaration failed: {0:?}")]
    Multiple(Vec<SchemaBuildError>),
}

struct PendingOperation {
    descriptor: OperationDescriptor,
    handler: RawOperationHandler,
}

/// Collects typed operations, events, and the status probe, then freezes
/// them into a [`Capability`].
pub struct CapabilityBuilder {
    name: String,
    issues: Vec<SchemaBuildError>,
    status: Option<(Value, RawStatusHandler)>,
    operations: BTreeMap<String, PendingOperation>,
    events: BTreeMap<String, EventDefinition>,
}

impl CapabilityBuilder {
    /// Start declaring a capability. The name must match
    /// `[A-Za-z][A-Za-z0-9_]*`; violations surface at [`build`](Self::build).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut issues = Vec::new();
        if !intersect_core::validation::valid_simple_name(&name) {
            issues.push(SchemaBuildError::InvalidCapabilityName(name.clone()));
        }
        Self {
            name,
            issues,
            status: None,
            operations: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    /// Register a request/response operation.
    ///
    /// `Req = ()` declares a no-argument operation; `Res = ()` declares a
    /// void operation that produces no reply.
    #[must_use]
    pub fn operation<Req, Res, F>(
        mut self,
        method_name: impl Into<String>,
        options: OperationOptions,
        handler: F,
    ) -> Self
    where
        Req: DeserializeOwned + JsonSchema + 'static,
        Res: Serialize + JsonSchema + 'static,
        F: Fn(&OperationContext, Req) -> crate::HandlerResult<Res> + Send + Sync + 'static,
    {
        let method_name = method_name.into();
        if !intersect_core::validation::valid_simple_name(&method_name) {
            self.issues.push(SchemaBuildError::InvalidOperationName {
                capability: self.name.clone(),
                name: method_name.clone(),
            });
            return self;
        }
        if self.operations.contains_key(&method_name) {
            self.issues.push(SchemaBuildError::DuplicateOperation {
                capability: self.name.clone(),
                name: method_name.clone(),
            });
            return self;
        }

        let takes_request = TypeId::of::<Req>() != TypeId::of::<()>();
        let returns_response = TypeId::of::<Res>() != TypeId::of::<()>();
        let request_type = takes_request.then(|| schema_value::<Req>());
        let response_type = returns_response.then(|| schema_value::<Res>());

        let erased: RawOperationHandler = Arc::new(move |context, value| {
            let request: Req = serde_json::from_value(value)
                .map_err(|error| OperationError::RequestDeserialization(error.to_string()))?;
            let response = handler(context, request)
                .map_err(|error| OperationError::Handler(error.to_string()))?;
            if !returns_response {
                return Ok(None);
            }
            let bytes = serde_json::to_vec(&response)
                .map_err(|error| OperationError::ResponseSerialization(error.to_string()))?;
            Ok(Some(bytes))
        });

        let descriptor = OperationDescriptor {
            operation_id: format!("{}.{method_name}", self.name),
            method_name: method_name.clone(),
            request_type,
            response_type,
            request_content_type: options.request_content_type,
            response_content_type: options.response_content_type,
            request_data_handler: options.request_data_handler,
            response_data_handler: options.response_data_handler,
            strict_request_validation: options.strict_request_validation,
            events_emitted: options.events.iter().cloned().collect::<BTreeSet<_>>(),
            documentation: options.documentation,
        };
        self.operations.insert(
            method_name,
            PendingOperation {
                descriptor,
                handler: erased,
            },
        );
        self
    }

    /// Register the status probe. Exactly one is required per capability.
    #[must_use]
    pub fn status<T, F>(mut self, handler: F) -> Self
    where
        T: Serialize + JsonSchema + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        if self.status.is_some() {
            self.issues.push(SchemaBuildError::DuplicateStatus {
                capability: self.name.clone(),
            });
            return self;
        }
        let erased: RawStatusHandler = Arc::new(move || {
            serde_json::to_vec(&handler())
                .map_err(|error| OperationError::ResponseSerialization(error.to_string()))
        });
        self.status = Some((schema_value::<T>(), erased));
        self
    }

    /// Declare an event this capability may emit.
    #[must_use]
    pub fn event<T: JsonSchema>(mut self, event_name: impl Into<String>, options: EventOptions) -> Self {
        let event_name = event_name.into();
        if !intersect_core::validation::valid_simple_name(&event_name) {
            self.issues.push(SchemaBuildError::InvalidEventName {
                capability: self.name.clone(),
                name: event_name.clone(),
            });
            return self;
        }
        if self.events.contains_key(&event_name) {
            self.issues.push(SchemaBuildError::DuplicateEvent {
                capability: self.name.clone(),
                name: event_name.clone(),
            });
            return self;
        }
        self.events.insert(
            event_name,
            EventDefinition {
                event_type: schema_value::<T>(),
                content_type: options.content_type,
                data_handler: options.data_handler,
                documentation: options.documentation,
            },
        );
        self
    }

    /// Validate the declaration and freeze it.
    ///
    /// # Errors
    ///
    /// [`SchemaBuildError`] describing every problem found.
    pub fn build(mut self) -> Result<Capability, SchemaBuildError> {
        let Some((status_type, status_handler)) = self.status.take() else {
            self.issues.push(SchemaBuildError::MissingStatus {
                capability: self.name.clone(),
            });
            return Err(collapse(self.issues));
        };

        for pending in self.operations.values() {
            for event in &pending.descriptor.events_emitted {
                if !self.events.contains_key(event) {
                    self.issues.push(SchemaBuildError::UndeclaredEvent {
                        capability: self.name.clone(),
                        operation: pending.descriptor.method_name.clone(),
                        event: event.clone(),
                    });
                }
            }
        }

        let mut event_validators = BTreeMap::new();
        for (event_name, definition) in &self.events {
            if !has_concrete_type(&definition.event_type) {
                self.issues.push(SchemaBuildError::UntypedEventSchema {
                    capability: self.name.clone(),
                    event: event_name.clone(),
                });
                continue;
            }
            match jsonschema::validator_for(&definition.event_type) {
                Ok(validator) => {
                    event_validators.insert(event_name.clone(), validator);
                }
                Err(error) => self.issues.push(SchemaBuildError::SchemaCompile {
                    capability: self.name.clone(),
                    subject: event_name.clone(),
                    reason: error.to_string(),
                }),
            }
        }

        let mut operations = BTreeMap::new();
        for (method_name, pending) in self.operations {
            let validator = match &pending.descriptor.request_type {
                None => None,
                Some(schema) => match jsonschema::validator_for(schema) {
                    Ok(validator) => Some(validator),
                    Err(error) => {
                        self.issues.push(SchemaBuildError::SchemaCompile {
                            capability: self.name.clone(),
                            subject: method_name.clone(),
                            reason: error.to_string(),
                        });
                        None
                    }
                },
            };
            operations.insert(
                method_name,
                Operation {
                    descriptor: pending.descriptor,
                    handler: pending.handler,
                    validator,
                },
            );
        }

        if !self.issues.is_empty() {
            return Err(collapse(self.issues));
        }

        let descriptor = CapabilityDescriptor {
            capability_name: self.name,
            status_type,
            operations: operations
                .iter()
                .map(|(name, op)| (name.clone(), op.descriptor.clone()))
                .collect(),
            events: self.events,
        };
        Ok(Capability::assemble(
            descriptor,
            status_handler,
            operations,
            event_validators,
        ))
    }
}

fn collapse(mut issues: Vec<SchemaBuildError>) -> SchemaBuildError {
    if issues.len() == 1 {
        issues.remove(0)
    } else {
        SchemaBuildError::Multiple(issues)
    }
}

fn schema_value<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(&schema).unwrap_or(Value::Bool(true))
}

/// `true` when the schema pins a concrete instance type (directly or via
/// `$ref`/composition), rather than being a match-anything placeholder.
fn has_concrete_type(schema: &Value) -> bool {
    match schema {
        Value::Bool(_) => false,
        Value::Object(map) => {
            map.contains_key("type")
                || map.contains_key("$ref")
                || map.contains_key("enum")
                || map.contains_key("const")
                || map.contains_key("oneOf")
                || map.contains_key("anyOf")
                || map.contains_key("allOf")
                || map.contains_key("properties")
        }
        _ => false,
    }
}
