// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! intersect-schema
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! In languages with decorator introspection the SDK scans a capability
//! object for annotated methods. Here the registration is explicit: a
//! [`CapabilityBuilder`] collects typed operations, events, and the status
//! probe, then [`CapabilityBuilder::build`] freezes them into a validated
//! [`Capability`] whose schema document is advertised on the control plane.
//! Everything that can go wrong does so at build time as a
//! [`SchemaBuildError`], never at dispatch time.

pub mod builder;
pub mod capability;
pub mod descriptor;

pub use builder::{CapabilityBuilder, EventOptions, OperationOptions, SchemaBuildError};
pub use capability::{
    Capability, CapabilityObserver, DirectMessageParams, HandlerResult, OperationContext,
    OperationError, ResponseHandler, ServiceResponse,
};
pub use descriptor::{CapabilityDescriptor, EventDefinition, OperationDescriptor};
