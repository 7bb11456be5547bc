//! File watcher bridging filesystem events into catalog mutations.
//!
//! Uses notify-debouncer-mini for efficient change detection across every
//! watched directory. Events become catalog mutations under the shared
//! mutex; a change that survives the bridge triggers a device notification.

use crate::SharedCatalog;
use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{CatalogStore, StoreError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Absolute path the event fired for
    pub path: PathBuf,
    /// Type of event
    pub kind: FileEventKind,
}

/// Type of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// Directories currently being watched, shared with the debouncer callback.
type WatchRoots = Arc<Mutex<Vec<PathBuf>>>;

/// File watcher covering every registered directory recursively.
pub struct FileWatcher {
    /// Watched roots (grows as directories are registered)
    roots: WatchRoots,
    /// Debouncer handle (must keep alive)
    debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for file events
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    /// Create a watcher with no directories registered yet.
    ///
    /// Uses a 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new() -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let roots: WatchRoots = Arc::new(Mutex::new(Vec::new()));
        let roots_for_callback = Arc::clone(&roots);

        let debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let roots = roots_for_callback
                        .lock()
                        .expect("watch roots mutex poisoned");
                    for event in events {
                        if let Some(file_event) = process_path(&event.path, &roots) {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("file watcher error: {}", e);
                }
            },
        )?;

        Ok(Self {
            roots,
            debouncer,
            event_rx,
        })
    }

    /// Register a directory for recursive watching.
    pub fn watch(&mut self, dir: &Path) -> Result<()> {
        // Canonicalize so event paths strip cleanly against the root.
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        self.debouncer
            .watcher()
            .watch(&dir, RecursiveMode::Recursive)?;
        self.roots
            .lock()
            .expect("watch roots mutex poisoned")
            .push(dir);
        Ok(())
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }
}

/// Turn a raw event path into a file event, or filter it out.
///
/// Paths outside every watched root, the roots themselves, dot-files and
/// anything under a dot-directory (the `.sync` data dir included) are
/// dropped. Existing directories are dropped too; only file-level events
/// flow through.
fn process_path(path: &Path, roots: &[PathBuf]) -> Option<FileEvent> {
    let rel = roots.iter().find_map(|root| path.strip_prefix(root).ok())?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    if rel
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
    {
        return None;
    }

    let kind = if path.exists() {
        if path.is_dir() {
            return None;
        }
        FileEventKind::Modified
    } else {
        // A deleted directory also lands here; the catalog lookup in
        // apply_event filters it out (directories are never tracked).
        FileEventKind::Deleted
    };

    debug!("file event: {:?} - {}", kind, path.display());
    Some(FileEvent {
        path: path.to_path_buf(),
        kind,
    })
}

/// Apply a file event to the catalog.
///
/// Returns true when the catalog changed and peers should be notified.
/// A file that vanishes between the event and the hash computation is
/// logged and skipped; the watch loop never dies over it.
pub async fn apply_event(event: &FileEvent, catalog: &SharedCatalog) -> bool {
    match event.kind {
        FileEventKind::Modified => {
            let added = {
                let mut cat = catalog.lock().await;
                cat.add_file(&event.path)
            };
            match added {
                Ok(file_hash) => {
                    info!("ingested {} ({})", event.path.display(), file_hash);
                    true
                }
                Err(StoreError::NotAFile(_)) => {
                    debug!("{} vanished before hashing, skipping", event.path.display());
                    false
                }
                Err(e) => {
                    warn!("cannot ingest {}: {}", event.path.display(), e);
                    false
                }
            }
        }
        FileEventKind::Deleted => {
            let mut cat = catalog.lock().await;
            let found = match cat.get_file_hash_by_path(&event.path) {
                Ok(found) => found,
                Err(e) => {
                    warn!("cannot look up {}: {}", event.path.display(), e);
                    None
                }
            };
            let Some(file_hash) = found else {
                debug!("{} was not tracked", event.path.display());
                return false;
            };

            let result = cat
                .remove_file(&file_hash)
                .and_then(|()| cat.remove_file_by_hash(&file_hash));
            match result {
                Ok(()) => {
                    info!("tombstoned {} ({})", event.path.display(), file_hash);
                    true
                }
                Err(e) => {
                    warn!("cannot tombstone {}: {}", event.path.display(), e);
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sync_core::{CatalogStore, MemoryStore};
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    fn memory_catalog() -> SharedCatalog {
        let store: Box<dyn CatalogStore> = Box::new(MemoryStore::new());
        Arc::new(AsyncMutex::new(store))
    }

    // ==================== Event filtering ====================

    #[test]
    fn test_process_path_modified_file() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let roots = vec![root.path().to_path_buf()];
        let event = process_path(&file, &roots).unwrap();
        assert_eq!(event.kind, FileEventKind::Modified);
        assert_eq!(event.path, file);
    }

    #[test]
    fn test_process_path_deleted_file() {
        let root = TempDir::new().unwrap();
        let gone = root.path().join("gone.txt");

        let roots = vec![root.path().to_path_buf()];
        let event = process_path(&gone, &roots).unwrap();
        assert_eq!(event.kind, FileEventKind::Deleted);
    }

    #[test]
    fn test_process_path_skips_directories() {
        let root = TempDir::new().unwrap();
        let sub = root.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let roots = vec![root.path().to_path_buf()];
        assert!(process_path(&sub, &roots).is_none());
        // The watched root itself never produces events either.
        assert!(process_path(root.path(), &roots).is_none());
    }

    #[test]
    fn test_process_path_skips_hidden_and_data_dir() {
        let root = TempDir::new().unwrap();
        let roots = vec![root.path().to_path_buf()];

        assert!(process_path(&root.path().join(".hidden"), &roots).is_none());
        assert!(process_path(&root.path().join(".sync/catalog.json"), &roots).is_none());
        assert!(process_path(&root.path().join("sub/.git/config"), &roots).is_none());
    }

    #[test]
    fn test_process_path_outside_roots() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let roots = vec![root.path().to_path_buf()];

        assert!(process_path(&other.path().join("a.txt"), &roots).is_none());
    }

    // ==================== Catalog bridging ====================

    #[tokio::test]
    async fn test_apply_modified_ingests() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let catalog = memory_catalog();
        let event = FileEvent {
            path: file.clone(),
            kind: FileEventKind::Modified,
        };

        assert!(apply_event(&event, &catalog).await);
        let cat = catalog.lock().await;
        assert!(cat.get_file_hash_by_path(&file).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_apply_modified_swallows_vanished_file() {
        let root = TempDir::new().unwrap();
        let catalog = memory_catalog();
        let event = FileEvent {
            path: root.path().join("already-gone.tmp"),
            kind: FileEventKind::Modified,
        };

        // Not fatal, and nothing to notify about.
        assert!(!apply_event(&event, &catalog).await);
        let cat = catalog.lock().await;
        assert!(cat.get_local_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_deleted_tombstones() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let catalog = memory_catalog();
        let file_hash = {
            let mut cat = catalog.lock().await;
            cat.add_file(&file).unwrap()
        };
        std::fs::remove_file(&file).unwrap();

        let event = FileEvent {
            path: file.clone(),
            kind: FileEventKind::Deleted,
        };
        assert!(apply_event(&event, &catalog).await);

        let cat = catalog.lock().await;
        assert_eq!(cat.get_deleted_files().unwrap(), vec![file_hash.clone()]);
        assert_eq!(cat.get_file_path_by_hash(&file_hash).unwrap(), None);
    }

    #[tokio::test]
    async fn test_apply_deleted_untracked_is_noop() {
        let root = TempDir::new().unwrap();
        let catalog = memory_catalog();
        let event = FileEvent {
            path: root.path().join("never-seen.txt"),
            kind: FileEventKind::Deleted,
        };

        assert!(!apply_event(&event, &catalog).await);
    }
}
