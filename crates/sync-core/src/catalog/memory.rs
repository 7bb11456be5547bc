//! In-memory catalog backend.
//!
//! Holds the record sets with no persistence. Used by tests and by
//! ephemeral daemon runs where losing the catalog on exit is acceptable.

use super::{CatalogData, CatalogStore, LocalFileRecord, Result, SharedFileRecord};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct MemoryStore {
    data: CatalogData,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogStore for MemoryStore {
    fn add_file(&mut self, path: &Path) -> Result<String> {
        self.data.add_file(path)
    }

    fn add_directory(&mut self, path: &Path) -> Result<()> {
        self.data.add_directory(path);
        Ok(())
    }

    fn remove_directory(&mut self, path: &Path) -> Result<()> {
        self.data.remove_directory(path);
        Ok(())
    }

    fn remove_file(&mut self, hash: &str) -> Result<()> {
        self.data.remove_file(hash);
        Ok(())
    }

    fn remove_file_by_hash(&mut self, hash: &str) -> Result<()> {
        self.data.remove_file_by_hash(hash);
        Ok(())
    }

    fn unsync_file(&mut self, path: &Path) -> Result<()> {
        self.data.unsync_file(path);
        Ok(())
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
        Ok(())
    }

    fn get_known_ips(&self) -> Result<Vec<IpAddr>> {
        Ok(self.data.get_known_ips())
    }

    fn shared_files(&self) -> Result<Vec<SharedFileRecord>> {
        Ok(self.data.shared.clone())
    }

    fn merge_shared(&mut self, records: Vec<SharedFileRecord>) -> Result<usize> {
        Ok(self.data.merge_shared(records))
    }
}
