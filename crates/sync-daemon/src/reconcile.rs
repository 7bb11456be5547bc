//! Reconciliation engine: closing the gap between local and shared state.
//!
//! Runs one full pass at startup, then loops on a periodic tick plus
//! wakeups from the catalog sync server. A pass downloads every missing
//! hash from whichever peer will serve it, then propagates tombstones to
//! disk. Per-peer failures are non-fatal; the next pass is the retry,
//! always at the same cadence.

use crate::net::local_ip;
use crate::{catalog_sync, transfer, SharedCatalog};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use sync_core::CatalogStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct Reconciler {
    pub catalog: SharedCatalog,
    /// Directory fetched files are written under
    pub root: PathBuf,
    /// Our own address, skipped when iterating peers
    pub my_ip: IpAddr,
    pub transfer_port: u16,
    pub interval: Duration,
}

impl Reconciler {
    pub fn new(catalog: SharedCatalog, root: PathBuf, transfer_port: u16, interval: Duration) -> Self {
        Self {
            catalog,
            root,
            my_ip: local_ip(),
            transfer_port,
            interval,
        }
    }

    /// Drive the engine until shutdown.
    ///
    /// `Startup -> InitialReconcile -> Watching(loop) -> Shutdown`.
    pub async fn run(
        self,
        mut wakeup_rx: mpsc::UnboundedReceiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.reconcile().await;

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // An interval fires immediately once; the initial pass already ran.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("periodic reconcile pass");
                    self.reconcile().await;
                }
                Some(()) = wakeup_rx.recv() => {
                    debug!("reconcile wakeup");
                    self.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    /// One full pass: fetch what is missing, then honor tombstones.
    pub async fn reconcile(&self) {
        self.download_missing_files().await;
        self.delete_marked_files().await;
    }

    /// Fetch every missing hash from the first peer that serves it.
    ///
    /// The missing set and the peer list are read under one lock
    /// acquisition so the two views cannot tear against a concurrent
    /// mutation. Iteration order carries no meaning.
    pub async fn download_missing_files(&self) {
        let (missing, ips) = {
            let cat = self.catalog.lock().await;
            match (cat.get_missing_files(), cat.get_known_ips()) {
                (Ok(missing), Ok(ips)) => (missing, ips),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("cannot read catalog: {}", e);
                    return;
                }
            }
        };
        if missing.is_empty() {
            debug!("no missing files");
            return;
        }

        let peers: Vec<SocketAddr> = ips
            .into_iter()
            .filter(|ip| *ip != self.my_ip)
            .map(|ip| SocketAddr::new(ip, self.transfer_port))
            .collect();

        info!("{} file(s) missing, {} peer(s) known", missing.len(), peers.len());
        self.fetch_from_peers(&missing, &peers).await;
    }

    /// Try each peer in turn for each hash; first success wins.
    pub async fn fetch_from_peers(&self, missing: &[String], peers: &[SocketAddr]) {
        for file_hash in missing {
            let mut fetched = false;
            for addr in peers {
                info!("requesting {} from {}", file_hash, addr);
                match transfer::fetch_file(*addr, file_hash, &self.root, &self.catalog).await {
                    Ok(path) => {
                        info!("fetched {} to {}", file_hash, path.display());
                        fetched = true;
                        break;
                    }
                    Err(e) => {
                        debug!("fetch of {} from {} failed: {}", file_hash, addr, e);
                    }
                }
            }
            if !fetched {
                // No backoff state: the next pass retries from scratch.
                info!("{} not available on any peer, retrying next pass", file_hash);
            }
        }
    }

    /// Propagate tombstones to disk.
    ///
    /// For each tombstoned hash with a local record: delete the file
    /// (already absent counts as done) and drop the local record. The
    /// shared tombstone itself is never purged.
    pub async fn delete_marked_files(&self) {
        let mut cat = self.catalog.lock().await;
        let deleted = match cat.get_deleted_files() {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("cannot read tombstones: {}", e);
                return;
            }
        };

        for file_hash in deleted {
            let path = match cat.get_file_path_by_hash(&file_hash) {
                Ok(Some(path)) => path,
                Ok(None) => continue,
                Err(e) => {
                    warn!("cannot resolve {}: {}", file_hash, e);
                    continue;
                }
            };

            match std::fs::remove_file(&path) {
                Ok(()) => info!("removed tombstoned file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} already absent", path.display());
                }
                Err(e) => {
                    // Keep the local record so the next pass retries.
                    warn!("cannot remove {}: {}", path.display(), e);
                    continue;
                }
            }

            if let Err(e) = cat.remove_file_by_hash(&file_hash) {
                warn!("cannot drop local record for {}: {}", file_hash, e);
            }
        }
    }

    /// Broadcast a change notification on behalf of this node.
    pub async fn notify_devices(&self, catalog_port: u16) {
        catalog_sync::notify_devices(&self.catalog, self.my_ip, catalog_port).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sync_core::{CatalogStore, MemoryStore, SharedFileRecord};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    fn memory_catalog() -> SharedCatalog {
        let store: Box<dyn CatalogStore> = Box::new(MemoryStore::new());
        Arc::new(Mutex::new(store))
    }

    fn test_self_ip() -> IpAddr {
        "10.255.255.1".parse().unwrap()
    }

    fn reconciler(catalog: SharedCatalog, root: PathBuf) -> Reconciler {
        Reconciler {
            catalog,
            root,
            my_ip: test_self_ip(),
            transfer_port: 0,
            interval: Duration::from_secs(30),
        }
    }

    async fn spawn_transfer_server(catalog: SharedCatalog, root: PathBuf) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(transfer::serve(listener, catalog, root, rx));
        (addr, tx)
    }

    // ==================== Tombstone processing ====================

    #[tokio::test]
    async fn test_delete_marked_files_removes_copy() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let catalog = memory_catalog();
        let file_hash = {
            let mut cat = catalog.lock().await;
            let file_hash = cat.add_file(&file).unwrap();
            cat.remove_file(&file_hash).unwrap();
            file_hash
        };

        let rec = reconciler(catalog.clone(), root.path().to_path_buf());
        rec.delete_marked_files().await;

        assert!(!file.exists());
        let cat = catalog.lock().await;
        // Local record gone, tombstone still standing.
        assert_eq!(cat.get_file_path_by_hash(&file_hash).unwrap(), None);
        assert_eq!(cat.get_deleted_files().unwrap(), vec![file_hash]);
    }

    #[tokio::test]
    async fn test_delete_marked_files_tolerates_absent_file() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let catalog = memory_catalog();
        let file_hash = {
            let mut cat = catalog.lock().await;
            let file_hash = cat.add_file(&file).unwrap();
            cat.remove_file(&file_hash).unwrap();
            file_hash
        };
        // Someone already deleted the file from disk.
        std::fs::remove_file(&file).unwrap();

        let rec = reconciler(catalog.clone(), root.path().to_path_buf());
        rec.delete_marked_files().await;

        let cat = catalog.lock().await;
        assert_eq!(cat.get_file_path_by_hash(&file_hash).unwrap(), None);
    }

    // ==================== Peer fallback ====================

    #[tokio::test]
    async fn test_second_peer_serves_after_first_not_found() {
        // Peer 1: authorized but empty.
        let root_1 = TempDir::new().unwrap();
        let catalog_1 = memory_catalog();
        {
            let mut cat = catalog_1.lock().await;
            cat.add_device("127.0.0.1".parse().unwrap()).unwrap();
        }
        let (addr_1, _shutdown_1) =
            spawn_transfer_server(catalog_1, root_1.path().to_path_buf()).await;

        // Peer 2: has the file.
        let root_2 = TempDir::new().unwrap();
        let file = root_2.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let catalog_2 = memory_catalog();
        let file_hash = {
            let mut cat = catalog_2.lock().await;
            cat.add_device("127.0.0.1".parse().unwrap()).unwrap();
            cat.add_file(&file).unwrap()
        };
        let (addr_2, _shutdown_2) =
            spawn_transfer_server(catalog_2, root_2.path().canonicalize().unwrap()).await;

        // Downloader knows the hash but has no copy.
        let root_b = TempDir::new().unwrap();
        let catalog_b = memory_catalog();
        {
            let mut cat = catalog_b.lock().await;
            cat.merge_shared(vec![SharedFileRecord {
                hash: file_hash.clone(),
                filename: "a.txt".into(),
                size: 5,
                last_modified: 1,
                deleted: false,
            }])
            .unwrap();
        }

        let rec = reconciler(catalog_b.clone(), root_b.path().to_path_buf());
        rec.fetch_from_peers(&[file_hash.clone()], &[addr_1, addr_2]).await;

        // The second peer delivered after the first answered NOT_FOUND.
        assert_eq!(
            std::fs::read(root_b.path().join("a.txt")).unwrap(),
            b"hello"
        );
        let cat = catalog_b.lock().await;
        assert!(cat.get_missing_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_peers_leave_hash_missing() {
        let root_1 = TempDir::new().unwrap();
        let catalog_1 = memory_catalog();
        {
            let mut cat = catalog_1.lock().await;
            cat.add_device("127.0.0.1".parse().unwrap()).unwrap();
        }
        let (addr_1, _shutdown_1) =
            spawn_transfer_server(catalog_1, root_1.path().to_path_buf()).await;

        let root_b = TempDir::new().unwrap();
        let catalog_b = memory_catalog();
        let wanted = sync_core::hash::hash_bytes(b"unavailable");
        {
            let mut cat = catalog_b.lock().await;
            cat.merge_shared(vec![SharedFileRecord {
                hash: wanted.clone(),
                filename: "gone.txt".into(),
                size: 11,
                last_modified: 1,
                deleted: false,
            }])
            .unwrap();
        }

        let rec = reconciler(catalog_b.clone(), root_b.path().to_path_buf());
        rec.fetch_from_peers(&[wanted.clone()], &[addr_1]).await;

        // Still missing, no state recorded beyond the catalog itself.
        let cat = catalog_b.lock().await;
        assert_eq!(cat.get_missing_files().unwrap(), vec![wanted]);
    }
}
