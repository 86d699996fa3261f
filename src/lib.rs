// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! intersect-sdk
#![deny(unsafe_code)]
//!
//! Umbrella crate re-exporting the SDK surface. Depend on the member
//! crates directly when you only need one side of the protocol.

pub use intersect_broker as broker;
pub use intersect_client as client;
pub use intersect_config as config;
pub use intersect_core as core;
pub use intersect_schema as schema;
pub use intersect_service as service;

pub use intersect_broker::{BrokerClient, ChannelManager, MemoryBroker, MemoryHub};
pub use intersect_client::{ClientLoopExit, IntersectClient};
pub use intersect_config::{ClientCallbackConfig, ClientConfig, ServiceConfig, discover_broker};
pub use intersect_core::{
    ContentType, DataHandler, ErrorRecord, Hierarchy, WireErrorCode, version_string,
};
pub use intersect_schema::{
    Capability, CapabilityBuilder, DirectMessageParams, EventOptions, OperationContext,
    OperationOptions,
};
pub use intersect_service::{IntersectService, LifecycleState, default_lifecycle_loop};
