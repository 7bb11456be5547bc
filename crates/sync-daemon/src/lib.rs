//! sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod catalog_sync;
pub mod config;
pub mod net;
pub mod reconcile;
pub mod transfer;
pub mod watcher;

use std::sync::Arc;
use sync_core::CatalogStore;
use tokio::sync::Mutex;

/// The single mutex guarding every catalog access in the process.
///
/// All four entry points (both protocol servers, the reconciler, the
/// watcher bridge) clone this handle; no component touches a store
/// without holding it.
pub type SharedCatalog = Arc<Mutex<Box<dyn CatalogStore>>>;

// Re-export key types for convenience
pub use config::{DaemonConfig, StoreKind};
pub use reconcile::Reconciler;
pub use transfer::TransferError;
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
