// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! intersect-service
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod datastore;
pub mod dispatch;
pub mod emitter;
pub mod lifecycle;
pub mod pending;
pub mod pool;
pub mod service;

pub use datastore::{DataReference, DataStore, DataStoreError, InMemoryDataStore};
pub use dispatch::{DispatchEngine, InboxKind};
pub use emitter::EventEmitter;
pub use lifecycle::{LifecycleState, MultiFlagLatch};
pub use pending::{DEFAULT_REQUEST_TIMEOUT, RequestBookkeeper};
pub use pool::{DEFAULT_DRAIN_GRACE, DispatchPool};
pub use service::{IntersectService, PostStartupCallback, ServiceError, default_lifecycle_loop};
