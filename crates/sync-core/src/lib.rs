//! sync-core: Library crate for the peer-to-peer file synchronization daemon.
//!
//! This crate provides the core functionality for:
//! - The catalog data model and the `CatalogStore` CRUD contract
//! - Content hashing (SHA-256 fingerprints keying every record)
//! - Pairing tokens (encrypted magnet URIs bootstrapping peers)
//! - Wire protocol constants and framing helpers
//! - The catalog snapshot exchange format

pub mod catalog;
pub mod hash;
pub mod pairing;
pub mod snapshot;
pub mod wire;

pub use catalog::{
    CatalogStore, DeviceRecord, DirectoryWatch, JsonStore, LocalFileRecord, MemoryStore,
    SharedFileRecord, StoreError,
};
pub use pairing::{TokenError, TokenPayload};
pub use snapshot::{CatalogSnapshot, SnapshotError};
