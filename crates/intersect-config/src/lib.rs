// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! intersect-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Loading these structs from files or dictionaries is the embedding
//! program's concern; this crate only defines the recognized shape and the
//! collect-all validation that makes `CONFIG_INVALID` startup-fatal.

pub mod discovery;

use intersect_core::hierarchy::valid_label;
use intersect_core::{ErrorKind, FieldErrors, Hierarchy};
use intersect_schema::DirectMessageParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use discovery::{DiscoveredBroker, DiscoveryError, discover_broker};

/// Default status-ticker period in seconds.
pub const DEFAULT_STATUS_INTERVAL: f64 = 300.0;
/// Smallest allowed status-ticker period in seconds.
pub const MIN_STATUS_INTERVAL: f64 = 30.0;

/// Configuration failed validation. Startup-fatal; never masked.
#[derive(Debug, Error)]
#[error("CONFIG_INVALID: {errors}")]
pub struct ConfigError {
    /// Every violated constraint as a `{path, kind}` pair.
    pub errors: FieldErrors,
}

/// Broker wire protocols the SDK can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerProtocol {
    /// MQTT 3.1.1.
    #[serde(rename = "mqtt3.1.1")]
    Mqtt311,
    /// MQTT 5.0.
    #[serde(rename = "mqtt5.0")]
    Mqtt50,
    /// AMQP 0.9.1.
    #[serde(rename = "amqp0.9.1")]
    Amqp091,
}

/// One broker connection entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Wire protocol to speak.
    pub protocol: BrokerProtocol,
    /// Broker hostname or IP.
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker TCP port. Must be greater than zero.
    pub port: u16,
    /// Username, at least one character.
    pub username: String,
    /// Password, at least one character.
    pub password: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl ControlPlaneConfig {
    fn validate(&self, prefix: &str, errors: &mut FieldErrors) {
        if self.host.is_empty() {
            errors.push(format!("{prefix}.host"), ErrorKind::StringTooShort);
        }
        if self.port == 0 {
            errors.push(format!("{prefix}.port"), ErrorKind::GreaterThan);
        }
        if self.username.is_empty() {
            errors.push(format!("{prefix}.username"), ErrorKind::StringTooShort);
        }
        if self.password.is_empty() {
            errors.push(format!("{prefix}.password"), ErrorKind::StringTooShort);
        }
    }
}

/// Either an explicit broker list or the literal `"discovery"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrokerSelection {
    /// Resolve brokers through the discovery service.
    Discovery(DiscoveryLiteral),
    /// Explicit, non-empty broker list.
    List(Vec<ControlPlaneConfig>),
}

/// The literal string `"discovery"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum DiscoveryLiteral {
    /// Marker value.
    #[serde(rename = "discovery")]
    Discovery,
}

impl BrokerSelection {
    fn validate(&self, errors: &mut FieldErrors) {
        match self {
            Self::Discovery(_) => {}
            Self::List(entries) => {
                if entries.is_empty() {
                    errors.push("brokers", ErrorKind::Missing);
                }
                for (i, entry) in entries.iter().enumerate() {
                    entry.validate(&format!("brokers.{i}"), errors);
                }
            }
        }
    }
}

/// One object-store entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreConfig {
    /// Store hostname or IP.
    #[serde(default = "default_host")]
    pub host: String,
    /// Store TCP port. Must be greater than zero.
    pub port: u16,
    /// Username, at least one character.
    pub username: String,
    /// Password, at least one character.
    pub password: String,
}

impl DataStoreConfig {
    fn validate(&self, prefix: &str, errors: &mut FieldErrors) {
        if self.host.is_empty() {
            errors.push(format!("{prefix}.host"), ErrorKind::StringTooShort);
        }
        if self.port == 0 {
            errors.push(format!("{prefix}.port"), ErrorKind::GreaterThan);
        }
        if self.username.is_empty() {
            errors.push(format!("{prefix}.username"), ErrorKind::StringTooShort);
        }
        if self.password.is_empty() {
            errors.push(format!("{prefix}.password"), ErrorKind::StringTooShort);
        }
    }
}

/// Object stores grouped by backend kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataStoreConfigMap {
    /// MinIO-compatible stores.
    #[serde(default)]
    pub minio: Vec<DataStoreConfig>,
}

impl DataStoreConfigMap {
    fn validate(&self, errors: &mut FieldErrors) {
        for (i, entry) in self.minio.iter().enumerate() {
            entry.validate(&format!("data_stores.minio.{i}"), errors);
        }
    }
}

/// Everything a service needs to come online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Identity of this service on the control plane.
    pub hierarchy: Hierarchy,
    /// Brokers to connect to.
    pub brokers: BrokerSelection,
    /// Object stores for `MINIO`-handled payloads.
    #[serde(default)]
    pub data_stores: DataStoreConfigMap,
    /// Status-ticker period in seconds, `>= 30`.
    #[serde(default = "default_status_interval")]
    pub status_interval: f64,
    /// Version advertised in the schema document. Defaults to the SDK version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

fn default_status_interval() -> f64 {
    DEFAULT_STATUS_INTERVAL
}

impl ServiceConfig {
    /// Check every constraint, collecting all violations.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] listing each violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = FieldErrors::new();
        validate_hierarchy(&self.hierarchy, &mut errors);
        self.brokers.validate(&mut errors);
        self.data_stores.validate(&mut errors);
        if self.status_interval < MIN_STATUS_INTERVAL {
            errors.push("status_interval", ErrorKind::GreaterThanEqual);
        }
        if let Some(version) = &self.schema_version {
            if !intersect_core::version::is_strict_semver(version) {
                errors.push("schema_version", ErrorKind::StringPatternMismatch);
            }
        }
        errors.into_result(()).map_err(|errors| ConfigError { errors })
    }
}

fn validate_hierarchy(hierarchy: &Hierarchy, errors: &mut FieldErrors) {
    let labels = [
        ("hierarchy.organization", Some(hierarchy.organization.as_str())),
        ("hierarchy.facility", Some(hierarchy.facility.as_str())),
        ("hierarchy.system", Some(hierarchy.system.as_str())),
        ("hierarchy.subsystem", hierarchy.subsystem.as_deref()),
        ("hierarchy.service", Some(hierarchy.service.as_str())),
    ];
    for (path, label) in labels {
        if let Some(label) = label {
            if !valid_label(label) {
                errors.push(path, ErrorKind::StringPatternMismatch);
            }
        }
    }
}

/// Initial traffic and event subscriptions for a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCallbackConfig {
    /// Messages to send as soon as the client is ready.
    #[serde(default)]
    pub messages_to_send: Vec<DirectMessageParams>,
    /// Dotted hierarchy names whose events the client wants.
    #[serde(default)]
    pub services_to_start_listening_for_events: Vec<String>,
    /// Dotted hierarchy names whose events the client no longer wants.
    #[serde(default)]
    pub services_to_stop_listening_for_events: Vec<String>,
}

/// Everything a client needs to come online.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Brokers to connect to.
    pub brokers: BrokerSelection,
    /// Traffic to generate on startup.
    pub initial_message_event_config: ClientCallbackConfig,
}

impl ClientConfig {
    /// Check every constraint, collecting all violations.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] listing each violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = FieldErrors::new();
        self.brokers.validate(&mut errors);
        let listens = self
            .initial_message_event_config
            .services_to_start_listening_for_events
            .iter()
            .enumerate();
        for (i, name) in listens {
            if Hierarchy::parse(name).is_err() {
                errors.push(
                    format!("initial_message_event_config.services_to_start_listening_for_events.{i}"),
                    ErrorKind::StringPatternMismatch,
                );
            }
        }
        errors.into_result(()).map_err(|errors| ConfigError { errors })
    }
}
