//! File-backed catalog backend.
//!
//! Loads the record sets from a JSON file on open and rewrites the file
//! after every mutation. The file lives in the daemon's data directory
//! (`<root>/.sync/catalog.json` by default).

use super::{CatalogData, CatalogStore, LocalFileRecord, Result, SharedFileRecord, StoreError};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct JsonStore {
    /// Path of the backing file
    path: PathBuf,
    /// In-memory copy of the record sets
    data: CatalogData,
}

impl JsonStore {
    /// Open the store, loading existing data when the file is present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let contents =
                fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
            serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt(e.to_string()))?
        } else {
            CatalogData::default()
        };

        debug!(
            "opened catalog at {} ({} shared, {} local)",
            path.display(),
            data.shared.len(),
            data.local.len()
        );
        Ok(Self { path, data })
    }

    /// Rewrite the backing file from the in-memory record sets.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(&self.data)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        fs::write(&self.path, contents).map_err(|e| StoreError::Io(e.to_string()))
    }
}

impl CatalogStore for JsonStore {
    fn add_file(&mut self, path: &Path) -> Result<String> {
        let hash = self.data.add_file(path)?;
        self.save()?;
        Ok(hash)
    }

    fn add_directory(&mut self, path: &Path) -> Result<()> {
        self.data.add_directory(path);
        self.save()
    }

    fn remove_directory(&mut self, path: &Path) -> Result<()> {
        self.data.remove_directory(path);
        self.save()
    }

    fn remove_file(&mut self, hash: &str) -> Result<()> {
        self.data.remove_file(hash);
        self.save()
    }

    fn remove_file_by_hash(&mut self, hash: &str) -> Result<()> {
        self.data.remove_file_by_hash(hash);
        self.save()
    }

    fn unsync_file(&mut self, path: &Path) -> Result<()> {
        self.data.unsync_file(path);
        self.save()
    }

    fn get_file_path_by_hash(&self, hash: &str) -> Result<Option<PathBuf>> {
        Ok(self.data.get_file_path_by_hash(hash))
    }

    fn get_file_hash_by_path(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.data.get_file_hash_by_path(path))
    }

    fn get_local_directories(&self) -> Result<Vec<PathBuf>> {
        Ok(self.data.directories.iter().map(|d| d.path.clone()).collect())
    }

    fn get_local_files(&self) -> Result<Vec<LocalFileRecord>> {
        Ok(self.data.local.clone())
    }

    fn get_missing_files(&self) -> Result<Vec<String>> {
        Ok(self.data.get_missing_files())
    }

    fn get_deleted_files(&self) -> Result<Vec<String>> {
        Ok(self.data.get_deleted_files())
    }

    fn add_device(&mut self, ip: IpAddr) -> Result<()> {
        self.data.add_device(ip);
        self.save()
    }

    fn get_known_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(self.data.get_known_ips())
    }

    fn shared_files(&self) -> Result<Vec<SharedFileRecord>> {
        Ok(self.data.shared.clone())
    }

    fn merge_shared(&mut self, records: Vec<SharedFileRecord>) -> Result<usize> {
        let changed = self.data.merge_shared(records);
        if changed > 0 {
            self.save()?;
        }
        Ok(changed)
    }
}
