//! Catalog sync protocol: snapshot exchange and change notifications.
//!
//! One port carries both jobs. A peer that connects and sends
//! `DB_UPDATED` is telling us its catalog changed; we pull a fresh
//! snapshot back from it and wake the reconciler. Any other command
//! (including an empty probe) gets our own snapshot streamed back.

use crate::net::{ACCEPT_TIMEOUT, IO_TIMEOUT};
use crate::SharedCatalog;
use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use sync_core::wire::{COMMAND_MAX_LEN, DB_NOT_UPDATED, DB_UPDATED};
use sync_core::{CatalogSnapshot, CatalogStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// On-disk name of the last snapshot pulled from a peer.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Read buffer for snapshot streams.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Accept loop for the catalog sync port.
///
/// Every accepted peer is recorded as a known device (opportunistic
/// discovery) unless the peer is this node itself. Connections are
/// handled in their own tasks; handler errors are logged, never fatal.
pub async fn serve(
    listener: TcpListener,
    catalog: SharedCatalog,
    data_dir: PathBuf,
    my_ip: IpAddr,
    peer_catalog_port: u16,
    wakeup: mpsc::UnboundedSender<()>,
    shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("catalog server listening on {}", addr),
        Err(_) => info!("catalog server listening"),
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        let (stream, addr) = match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                error!("catalog server accept failed: {}", e);
                continue;
            }
            Ok(Ok(conn)) => conn,
        };

        if addr.ip() == my_ip {
            debug!("connection from self, ignoring");
            continue;
        }

        let catalog = catalog.clone();
        let data_dir = data_dir.clone();
        let wakeup = wakeup.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, addr, catalog, &data_dir, peer_catalog_port, wakeup)
                    .await
            {
                warn!("error handling catalog request from {}: {}", addr, e);
            }
        });
    }
    info!("catalog server stopped");
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    catalog: SharedCatalog,
    data_dir: &Path,
    peer_catalog_port: u16,
    wakeup: mpsc::UnboundedSender<()>,
) -> Result<()> {
    {
        let mut cat = catalog.lock().await;
        cat.add_device(addr.ip())?;
    }

    let mut buf = [0u8; COMMAND_MAX_LEN];
    let n = match timeout(IO_TIMEOUT, stream.read(&mut buf)).await {
        Err(_) => {
            warn!("timed out waiting for command from {}, dropping connection", addr);
            return Ok(());
        }
        Ok(read) => read?,
    };

    if &buf[..n] == DB_UPDATED {
        info!("catalog change notification from {}", addr);
        match download_snapshot(addr.ip(), peer_catalog_port, &catalog, data_dir).await {
            Ok(changed) => {
                debug!("merged {} records from {}", changed, addr.ip());
                let _ = wakeup.send(());
            }
            Err(e) => warn!("failed to pull catalog from {}: {}", addr.ip(), e),
        }
        return Ok(());
    }

    // Everything else, the empty probe included, is a pull.
    let bytes = {
        let cat = catalog.lock().await;
        CatalogSnapshot::from_store(cat.as_ref())?.to_bytes()
    };
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;
    info!("sent catalog snapshot ({} bytes) to {}", bytes.len(), addr);
    Ok(())
}

/// Pull a peer's snapshot and merge it into the local catalog.
///
/// The received bytes replace `<data_dir>/snapshot.json` atomically
/// (write-then-rename) before the merge. Returns how many shared
/// records changed. On success the caller is expected to trigger a
/// reconciliation pass.
pub async fn download_snapshot(
    host: IpAddr,
    port: u16,
    catalog: &SharedCatalog,
    data_dir: &Path,
) -> Result<usize> {
    let addr = SocketAddr::new(host, port);
    let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", addr))?
        .with_context(|| format!("cannot connect to {}", addr))?;

    stream.write_all(DB_NOT_UPDATED).await?;

    let mut bytes = Vec::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = timeout(IO_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| anyhow!("timed out reading snapshot from {}", addr))??;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
    }

    let snapshot = CatalogSnapshot::from_bytes(&bytes)
        .with_context(|| format!("unusable snapshot from {}", addr))?;
    replace_snapshot_file(data_dir, &bytes).await?;

    let changed = {
        let mut cat = catalog.lock().await;
        snapshot.merge_into(cat.as_mut())?
    };
    info!(
        "pulled snapshot from {} ({} records, {} changed)",
        host,
        snapshot.shared_files.len(),
        changed
    );
    Ok(changed)
}

async fn replace_snapshot_file(data_dir: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(data_dir).await?;
    let tmp = data_dir.join(format!("{SNAPSHOT_FILE}.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, data_dir.join(SNAPSHOT_FILE)).await
}

/// Broadcast `DB_UPDATED` to every known device except ourselves.
///
/// Fire and forget: one connection per peer, no acknowledgement, and a
/// peer that cannot be reached never blocks notifying the rest.
pub async fn notify_devices(catalog: &SharedCatalog, my_ip: IpAddr, catalog_port: u16) {
    let ips = {
        let cat = catalog.lock().await;
        match cat.get_known_ips() {
            Ok(ips) => ips,
            Err(e) => {
                warn!("cannot read device list: {}", e);
                return;
            }
        }
    };

    for ip in ips {
        if ip == my_ip {
            continue;
        }
        let addr = SocketAddr::new(ip, catalog_port);
        let sent = async {
            let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| anyhow!("connect timeout"))??;
            stream.write_all(DB_UPDATED).await?;
            stream.shutdown().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match sent {
            Ok(()) => debug!("notified {}", ip),
            Err(e) => warn!("failed to notify {}: {}", ip, e),
        }
    }
}
