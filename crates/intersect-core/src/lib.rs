// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! intersect-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable wire contract for INTERSECT services and clients.
//!
//! If you only take one dependency, take this one.

pub mod content;
pub mod error;
pub mod hierarchy;
pub mod message;
pub mod validation;
pub mod version;

pub use content::{ContentType, DataHandler};
pub use error::{ErrorRecord, WireErrorCode};
pub use hierarchy::{Hierarchy, InvalidIdentity};
pub use message::event::{EventHeaders, EventMessage};
pub use message::lifecycle::{LifecycleHeaders, LifecycleMessage, LifecycleType};
pub use message::userspace::{UserspaceHeaders, UserspaceMessage, UserspaceMessageOptions};
pub use validation::{ErrorKind, FieldError, FieldErrors, MessageValidationError};
pub use version::{resolve_peer_version, resolve_versions, version_info, version_string};
