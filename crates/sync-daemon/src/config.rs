//! Daemon configuration.
//!
//! Stored as JSON in `<root>/.sync/config.json`. Command-line flags
//! override individual fields; defaults cover the rest. The catalog
//! backend is chosen here, at startup, and nowhere else.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use sync_core::{CatalogStore, JsonStore, MemoryStore, StoreError};
use tracing::debug;

/// Port serving file bytes by content hash.
pub const DEFAULT_TRANSFER_PORT: u16 = 65432;

/// Port serving catalog snapshots and change notifications.
pub const DEFAULT_CATALOG_PORT: u16 = 65431;

const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;

/// Name of the daemon's data directory under the sync root.
pub const DATA_DIR_NAME: &str = ".sync";

const CONFIG_FILE: &str = "config.json";
const CATALOG_FILE: &str = "catalog.json";

/// Which catalog backend to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// File-backed catalog that survives restarts
    Json,
    /// In-memory catalog, lost on exit
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory downloads land in; relative wire paths resolve here
    pub root: PathBuf,
    /// Address both listeners bind to
    pub listen_addr: IpAddr,
    pub transfer_port: u16,
    pub catalog_port: u16,
    pub store: StoreKind,
    /// Seconds between periodic reconciliation passes
    pub reconcile_interval_secs: u64,
    /// Name embedded in pairing tokens (`dn` parameter)
    pub display_name: String,
}

impl DaemonConfig {
    pub fn defaults(root: PathBuf) -> Self {
        Self {
            root,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            transfer_port: DEFAULT_TRANSFER_PORT,
            catalog_port: DEFAULT_CATALOG_PORT,
            store: StoreKind::Json,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            display_name: "sync-daemon".to_string(),
        }
    }

    /// Load the config stored under `root`, or defaults if none exists.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let path = root.join(DATA_DIR_NAME).join(CONFIG_FILE);

        if !path.exists() {
            return Ok(Self::defaults(root));
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("cannot parse {}", path.display()))?;
        // The tree may have been moved since the config was written.
        config.root = root;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Persist the config under the data directory.
    pub fn save(&self) -> Result<()> {
        let dir = self.data_dir();
        fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);
        let contents =
            serde_json::to_string_pretty(self).expect("DaemonConfig serialization should not fail");
        fs::write(&path, contents).with_context(|| format!("cannot write {}", path.display()))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR_NAME)
    }

    /// Open the configured catalog backend.
    pub fn open_store(&self) -> std::result::Result<Box<dyn CatalogStore>, StoreError> {
        match self.store {
            StoreKind::Json => Ok(Box::new(JsonStore::open(self.data_dir().join(CATALOG_FILE))?)),
            StoreKind::Memory => Ok(Box::new(MemoryStore::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig::load_or_default(dir.path()).unwrap();

        assert_eq!(config.transfer_port, DEFAULT_TRANSFER_PORT);
        assert_eq!(config.catalog_port, DEFAULT_CATALOG_PORT);
        assert_eq!(config.store, StoreKind::Json);
        assert_eq!(config.root, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::defaults(dir.path().canonicalize().unwrap());
        config.transfer_port = 12345;
        config.display_name = "box-a".into();
        config.save().unwrap();

        let loaded = DaemonConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.transfer_port, 12345);
        assert_eq!(loaded.display_name, "box-a");
    }

    #[test]
    fn test_open_store_backends() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::defaults(dir.path().to_path_buf());

        config.store = StoreKind::Memory;
        assert!(config.open_store().is_ok());

        config.store = StoreKind::Json;
        let mut store = config.open_store().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        store.add_file(&file).unwrap();
        assert!(config.data_dir().join(CATALOG_FILE).exists());
    }
}
