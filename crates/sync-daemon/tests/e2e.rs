//! End-to-end tests for sync-daemon.
//!
//! Exercises two nodes over real localhost TCP: snapshot pulls, missing
//! file downloads over the transfer protocol, and tombstone propagation.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sync_core::{CatalogStore, MemoryStore};
use sync_daemon::{catalog_sync, transfer, Reconciler, SharedCatalog};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};

fn memory_catalog() -> SharedCatalog {
    let store: Box<dyn CatalogStore> = Box::new(MemoryStore::new());
    Arc::new(Mutex::new(store))
}

/// An IP this test host does not use, so peer iteration and
/// self-connection checks behave as they would across real machines.
fn self_ip_a() -> IpAddr {
    "10.255.255.1".parse().unwrap()
}

fn self_ip_b() -> IpAddr {
    "10.255.255.2".parse().unwrap()
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// One node's running servers, enough for another node to sync against.
struct TestNode {
    catalog: SharedCatalog,
    root: PathBuf,
    transfer_addr: SocketAddr,
    catalog_addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
    _wakeup_rx: mpsc::UnboundedReceiver<()>,
}

impl TestNode {
    async fn start(root: &TempDir, my_ip: IpAddr) -> Self {
        let root_path = root.path().canonicalize().unwrap();
        let catalog = memory_catalog();

        let transfer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transfer_addr = transfer_listener.local_addr().unwrap();
        let catalog_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let catalog_addr = catalog_listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();

        tokio::spawn(transfer::serve(
            transfer_listener,
            catalog.clone(),
            root_path.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(catalog_sync::serve(
            catalog_listener,
            catalog.clone(),
            root_path.join(".sync"),
            my_ip,
            0,
            wakeup_tx,
            shutdown_rx,
        ));

        Self {
            catalog,
            root: root_path,
            transfer_addr,
            catalog_addr,
            _shutdown: shutdown_tx,
            _wakeup_rx: wakeup_rx,
        }
    }

    async fn ingest(&self, name: &str, contents: &[u8]) -> String {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        let mut cat = self.catalog.lock().await;
        cat.add_file(&path).unwrap()
    }

    async fn authorize(&self, ip: IpAddr) {
        let mut cat = self.catalog.lock().await;
        cat.add_device(ip).unwrap();
    }

    fn reconciler(&self, my_ip: IpAddr, transfer_port: u16) -> Reconciler {
        Reconciler {
            catalog: self.catalog.clone(),
            root: self.root.clone(),
            my_ip,
            transfer_port,
            interval: Duration::from_secs(30),
        }
    }
}

// ==================== Pairing scenario ====================

#[tokio::test]
async fn test_node_b_syncs_missing_file_from_node_a() {
    // Node A ingests a file.
    let dir_a = TempDir::new().unwrap();
    let node_a = TestNode::start(&dir_a, self_ip_a()).await;
    let file_hash = node_a.ingest("docs/hello.txt", b"hello").await;
    assert_eq!(
        file_hash,
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    node_a.authorize(localhost()).await;

    // Node B learns about A (as the join flow would) and pulls the
    // catalog snapshot.
    let dir_b = TempDir::new().unwrap();
    let node_b = TestNode::start(&dir_b, self_ip_b()).await;
    node_b.authorize(localhost()).await;
    catalog_sync::download_snapshot(
        localhost(),
        node_a.catalog_addr.port(),
        &node_b.catalog,
        &node_b.root.join(".sync"),
    )
    .await
    .unwrap();

    {
        let cat = node_b.catalog.lock().await;
        assert_eq!(cat.get_missing_files().unwrap(), vec![file_hash.clone()]);
    }

    // Reconcile: the missing file arrives over the transfer protocol.
    let rec = node_b.reconciler(self_ip_b(), node_a.transfer_addr.port());
    rec.reconcile().await;

    // Identical bytes at the mirrored path, and a local record for it.
    let copy = node_b.root.join("docs/hello.txt");
    assert_eq!(std::fs::read(&copy).unwrap(), b"hello");
    let cat = node_b.catalog.lock().await;
    assert!(cat.get_missing_files().unwrap().is_empty());
    assert_eq!(
        cat.get_file_path_by_hash(&file_hash).unwrap(),
        Some(copy.canonicalize().unwrap())
    );
}

// ==================== Tombstone propagation ====================

#[tokio::test]
async fn test_tombstone_propagates_to_node_b() {
    // Both nodes hold the same content.
    let dir_a = TempDir::new().unwrap();
    let node_a = TestNode::start(&dir_a, self_ip_a()).await;
    let file_hash = node_a.ingest("x.txt", b"shared bytes").await;

    let dir_b = TempDir::new().unwrap();
    let node_b = TestNode::start(&dir_b, self_ip_b()).await;
    let hash_b = node_b.ingest("x.txt", b"shared bytes").await;
    assert_eq!(file_hash, hash_b);

    // Node A deletes the file everywhere: tombstone + local removal.
    {
        let mut cat = node_a.catalog.lock().await;
        cat.remove_file(&file_hash).unwrap();
        cat.remove_file_by_hash(&file_hash).unwrap();
    }
    std::fs::remove_file(node_a.root.join("x.txt")).unwrap();

    // Node B pulls the updated snapshot and processes tombstones.
    catalog_sync::download_snapshot(
        localhost(),
        node_a.catalog_addr.port(),
        &node_b.catalog,
        &node_b.root.join(".sync"),
    )
    .await
    .unwrap();
    let rec = node_b.reconciler(self_ip_b(), 0);
    rec.delete_marked_files().await;

    // The copy is gone; the tombstone persists.
    assert!(!node_b.root.join("x.txt").exists());
    let cat = node_b.catalog.lock().await;
    assert_eq!(cat.get_file_path_by_hash(&file_hash).unwrap(), None);
    assert_eq!(cat.get_deleted_files().unwrap(), vec![file_hash]);
}

// ==================== Notification round trip ====================

#[tokio::test]
async fn test_change_notification_reaches_peer_catalog() {
    // Node A serves its catalog; its server pulls back from notifiers
    // on node B's catalog port.
    let dir_b = TempDir::new().unwrap();
    let root_b = dir_b.path().canonicalize().unwrap();
    let catalog_b = memory_catalog();

    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_b = listener_b.local_addr().unwrap();
    let (shutdown_b, shutdown_rx_b) = watch::channel(false);
    let (wakeup_tx_b, _wakeup_rx_b) = mpsc::unbounded_channel();
    tokio::spawn(catalog_sync::serve(
        listener_b,
        catalog_b.clone(),
        root_b.join(".sync"),
        self_ip_b(),
        0,
        wakeup_tx_b,
        shutdown_rx_b,
    ));

    let dir_a = TempDir::new().unwrap();
    let root_a = dir_a.path().canonicalize().unwrap();
    let catalog_a = memory_catalog();
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    let (shutdown_a, shutdown_rx_a) = watch::channel(false);
    let (wakeup_tx_a, mut wakeup_rx_a) = mpsc::unbounded_channel();
    tokio::spawn(catalog_sync::serve(
        listener_a,
        catalog_a.clone(),
        root_a.join(".sync"),
        self_ip_a(),
        addr_b.port(),
        wakeup_tx_a,
        shutdown_rx_a,
    ));

    // B ingests a file and notifies its known devices (A).
    let file = root_b.join("new.txt");
    std::fs::write(&file, b"fresh content").unwrap();
    let file_hash = {
        let mut cat = catalog_b.lock().await;
        cat.add_file(&file).unwrap()
    };
    {
        let mut cat = catalog_b.lock().await;
        cat.add_device(localhost()).unwrap();
    }
    catalog_sync::notify_devices(&catalog_b, self_ip_b(), addr_a.port()).await;

    // A reacts by pulling B's snapshot and waking its reconciler.
    tokio::time::timeout(Duration::from_secs(5), wakeup_rx_a.recv())
        .await
        .expect("wakeup not delivered")
        .expect("wakeup channel closed");

    let cat = catalog_a.lock().await;
    assert_eq!(cat.get_missing_files().unwrap(), vec![file_hash]);

    drop(shutdown_a);
    drop(shutdown_b);
}
