//! Catalog data model and the store contract.
//!
//! The catalog is the record of what this node shares, what it keeps
//! locally, which directories it watches, and which peer devices it knows.
//! All components access it only through the [`CatalogStore`] trait;
//! backends are swappable at startup:
//! - `MemoryStore` - in-memory, for tests and ephemeral runs
//! - `JsonStore` - file-backed via serde_json

mod json;
mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use crate::hash;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt catalog data: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A piece of content that is part of the shared set.
///
/// Keyed by the SHA-256 of the file bytes. Never physically removed:
/// `deleted = true` is a tombstone that persists forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedFileRecord {
    /// Content hash (lowercase hex, globally unique key)
    pub hash: String,
    /// Base name of the file when it was ingested
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time, seconds since epoch
    pub last_modified: u64,
    /// Tombstone marker
    pub deleted: bool,
}

/// A piece of content this node currently keeps on disk.
///
/// One record per hash: duplicate-content files at different paths
/// collapse onto the same record. Known limitation, kept on purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFileRecord {
    /// Content hash (shares the shared set's identity space)
    pub hash: String,
    /// Absolute path on this node
    pub path: PathBuf,
    /// Known but intentionally not kept here
    pub ignored: bool,
}

/// A directory this node monitors for changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryWatch {
    pub path: PathBuf,
}

/// A peer device observed via pairing or an inbound connection.
///
/// Upserted on every observation; never expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub ip: IpAddr,
    /// Seconds since epoch at last observation
    pub last_seen: u64,
}

/// Synchronous CRUD contract over the catalog.
///
/// Every method must be safe to call while holding the daemon's single
/// catalog mutex; none may block on the network. Mutations that touch
/// disk are limited to hashing the file being ingested.
pub trait CatalogStore: Send {
    /// Ingest a file: upsert its shared record (clearing any tombstone)
    /// and its local record. Returns the content hash.
    fn add_file(&mut self, path: &Path) -> Result<String>;

    /// Register a directory for watching.
    fn add_directory(&mut self, path: &Path) -> Result<()>;

    /// Unregister a watched directory.
    fn remove_directory(&mut self, path: &Path) -> Result<()>;

    /// Tombstone a shared record. No-op for unknown hashes.
    fn remove_file(&mut self, hash: &str) -> Result<()>;

    /// Drop the local record for a hash. No-op for unknown hashes.
    fn remove_file_by_hash(&mut self, hash: &str) -> Result<()>;

    /// Mark the local record for a path as ignored.
    fn unsync_file(&mut self, path: &Path) -> Result<()>;

    fn get_file_path_by_hash(&self, hash: &str) -> Result<Option<PathBuf>>;

    fn get_file_hash_by_path(&self, path: &Path) -> Result<Option<String>>;

    fn get_local_directories(&self) -> Result<Vec<PathBuf>>;

    fn get_local_files(&self) -> Result<Vec<LocalFileRecord>>;

    /// Shared non-deleted hashes with no non-ignored local record.
    /// Recomputed on every call, never cached.
    fn get_missing_files(&self) -> Result<Vec<String>>;

    /// Hashes of all tombstoned shared records.
    fn get_deleted_files(&self) -> Result<Vec<String>>;

    /// Upsert a device record, stamping `last_seen` with the current time.
    fn add_device(&mut self, ip: IpAddr) -> Result<()>;

    fn get_known_ips(&self) -> Result<Vec<IpAddr>>;

    /// All shared records, tombstones included. This is the snapshot seam
    /// used by the catalog sync protocol.
    fn shared_files(&self) -> Result<Vec<SharedFileRecord>>;

    /// Merge shared records received from a peer. Tombstones win over
    /// live records; between live records the newer `last_modified` wins.
    /// Returns how many records were inserted or updated.
    fn merge_shared(&mut self, records: Vec<SharedFileRecord>) -> Result<usize>;
}

/// The record sets behind both backends.
///
/// Backends wrap this and add (or skip) persistence, mirroring the split
/// between an in-memory collection and its on-disk storage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogData {
    pub shared: Vec<SharedFileRecord>,
    pub local: Vec<LocalFileRecord>,
    pub directories: Vec<DirectoryWatch>,
    pub devices: Vec<DeviceRecord>,
}

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn now_secs() -> u64 {
    epoch_secs(SystemTime::now())
}

/// Resolve a path like the ingestion layer sees it. Falls back to the
/// raw path when the target no longer exists.
fn resolve(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn io_err(path: &Path, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotAFile(path.display().to_string())
    } else {
        StoreError::Io(format!("{}: {}", path.display(), e))
    }
}

impl CatalogData {
    pub fn add_file(&mut self, path: &Path) -> Result<String> {
        let path = resolve(path);
        let meta = std::fs::metadata(&path).map_err(|e| io_err(&path, e))?;
        if !meta.is_file() {
            return Err(StoreError::NotAFile(path.display().to_string()));
        }

        let file_hash = hash::hash_file(&path).map_err(|e| io_err(&path, e))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let last_modified = meta.modified().map(epoch_secs).unwrap_or_else(|_| now_secs());

        let record = SharedFileRecord {
            hash: file_hash.clone(),
            filename,
            size: meta.len(),
            last_modified,
            deleted: false,
        };
        if let Some(existing) = self.shared.iter_mut().find(|r| r.hash == file_hash) {
            *existing = record;
        } else {
            self.shared.push(record);
        }

        let local = LocalFileRecord {
            hash: file_hash.clone(),
            path,
            ignored: false,
        };
        if let Some(existing) = self.local.iter_mut().find(|r| r.hash == file_hash) {
            *existing = local;
        } else {
            self.local.push(local);
        }

        Ok(file_hash)
    }

    pub fn add_directory(&mut self, path: &Path) {
        let path = resolve(path);
        if !self.directories.iter().any(|d| d.path == path) {
            self.directories.push(DirectoryWatch { path });
        }
    }

    pub fn remove_directory(&mut self, path: &Path) {
        let path = resolve(path);
        self.directories.retain(|d| d.path != path);
    }

    pub fn remove_file(&mut self, hash: &str) {
        if let Some(record) = self.shared.iter_mut().find(|r| r.hash == hash) {
            record.deleted = true;
        }
    }

    pub fn remove_file_by_hash(&mut self, hash: &str) {
        self.local.retain(|r| r.hash != hash);
    }

    pub fn unsync_file(&mut self, path: &Path) {
        let path = resolve(path);
        if let Some(record) = self.local.iter_mut().find(|r| r.path == path) {
            record.ignored = true;
        }
    }

    pub fn get_file_path_by_hash(&self, hash: &str) -> Option<PathBuf> {
        self.local
            .iter()
            .find(|r| r.hash == hash)
            .map(|r| r.path.clone())
    }

    pub fn get_file_hash_by_path(&self, path: &Path) -> Option<String> {
        let path = resolve(path);
        self.local
            .iter()
            .find(|r| r.path == path)
            .map(|r| r.hash.clone())
    }

    pub fn get_missing_files(&self) -> Vec<String> {
        let local: HashSet<&str> = self
            .local
            .iter()
            .filter(|r| !r.ignored)
            .map(|r| r.hash.as_str())
            .collect();

        self.shared
            .iter()
            .filter(|r| !r.deleted && !local.contains(r.hash.as_str()))
            .map(|r| r.hash.clone())
            .collect()
    }

    pub fn get_deleted_files(&self) -> Vec<String> {
        self.shared
            .iter()
            .filter(|r| r.deleted)
            .map(|r| r.hash.clone())
            .collect()
    }

    pub fn add_device(&mut self, ip: IpAddr) {
        let last_seen = now_secs();
        if let Some(device) = self.devices.iter_mut().find(|d| d.ip == ip) {
            device.last_seen = last_seen;
        } else {
            self.devices.push(DeviceRecord { ip, last_seen });
        }
    }

    pub fn get_known_ips(&self) -> Vec<IpAddr> {
        self.devices.iter().map(|d| d.ip).collect()
    }

    pub fn merge_shared(&mut self, records: Vec<SharedFileRecord>) -> usize {
        let mut changed = 0;
        for incoming in records {
            match self.shared.iter_mut().find(|r| r.hash == incoming.hash) {
                None => {
                    self.shared.push(incoming);
                    changed += 1;
                }
                Some(existing) => {
                    if existing.deleted {
                        // Tombstones are permanent: a peer's live record
                        // never resurrects one.
                        continue;
                    }
                    if incoming.deleted || incoming.last_modified > existing.last_modified {
                        *existing = incoming;
                        changed += 1;
                    }
                }
            }
        }
        changed
    }
}
