// SPDX-License-Identifier: MIT OR Apache-2.0
//! The object-store seam behind `DataHandler::Minio`.
//!
//! When a message's data handler selects the object store, the payload on
//! the wire is a small JSON [`DataReference`] and the real bytes live in
//! the store. Only the seam is defined here; production backends plug in
//! behind [`DataStore`]. [`InMemoryDataStore`] serves tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// The wire form of an object-store payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReference {
    /// Store backend kind (e.g. `minio`).
    pub backend: String,
    /// Object key within the store.
    pub key: String,
}

/// Object-store access failed.
#[derive(Debug, Error)]
pub enum DataStoreError {
    /// No object under the referenced key.
    #[error("no object under key '{0}'")]
    NotFound(String),

    /// Backend-specific failure.
    #[error("data store failure: {0}")]
    Backend(String),
}

/// Fetch/store contract for `MINIO`-handled payloads.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch the bytes a reference points at.
    async fn fetch(&self, reference: &DataReference) -> Result<Vec<u8>, DataStoreError>;

    /// Store bytes and mint a reference to them.
    async fn store(&self, payload: &[u8]) -> Result<DataReference, DataStoreError>;
}

/// Process-local store for tests and examples.
#[derive(Default)]
pub struct InMemoryDataStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    next_key: AtomicU64,
}

impl InMemoryDataStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn fetch(&self, reference: &DataReference) -> Result<Vec<u8>, DataStoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(&reference.key)
            .cloned()
            .ok_or_else(|| DataStoreError::NotFound(reference.key.clone()))
    }

    async fn store(&self, payload: &[u8]) -> Result<DataReference, DataStoreError> {
        let key = format!("obj-{}", self.next_key.fetch_add(1, Ordering::Relaxed));
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(key.clone(), payload.to_vec());
        Ok(DataReference {
            backend: "minio".to_string(),
            key,
        })
    }
}
