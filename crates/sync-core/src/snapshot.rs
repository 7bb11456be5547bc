//! Catalog snapshot exchange format.
//!
//! The catalog sync protocol moves whole snapshots between peers: the
//! passive side streams these bytes, the pulling side parses and merges
//! them. JSON keeps the format inspectable on disk; the merge itself is
//! the store's tombstone-wins upsert.

use crate::catalog::{CatalogStore, SharedFileRecord, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Invalid snapshot data: {0}")]
    Parse(String),
}

/// A serialized view of the shared set, tombstones included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CatalogSnapshot {
    pub shared_files: Vec<SharedFileRecord>,
}

impl CatalogSnapshot {
    /// Capture the current shared set from a store.
    ///
    /// Callers must hold the catalog mutex across the capture so the
    /// snapshot is not torn against concurrent mutation.
    pub fn from_store(store: &dyn CatalogStore) -> Result<Self, StoreError> {
        Ok(Self {
            shared_files: store.shared_files()?,
        })
    }

    /// Serialize to the bytes that go over the wire (and onto disk).
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("CatalogSnapshot serialization should not fail")
    }

    /// Parse snapshot bytes received from a peer.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        serde_json::from_slice(data).map_err(|e| SnapshotError::Parse(e.to_string()))
    }

    /// Merge this snapshot into a store. Returns how many records changed.
    pub fn merge_into(&self, store: &mut dyn CatalogStore) -> Result<usize, StoreError> {
        store.merge_shared(self.shared_files.clone())
    }
}
