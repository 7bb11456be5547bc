//! Transfer protocol: serving and fetching file bytes by content hash.
//!
//! A request is exactly 64 bytes of UTF-8 hash. The server answers with
//! one of three literal error tokens, or a `u32be` relative-path length
//! followed by the path and the raw file bytes. Authorization is the IP
//! allow-list in the device registry, checked before any catalog lookup.

use crate::net::{ACCEPT_TIMEOUT, IO_TIMEOUT};
use crate::SharedCatalog;
use anyhow::Result;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use sync_core::wire::{
    classify_reply, decode_hash_request, encode_hash_request, ReplyKind, HASH_WIRE_LEN,
    INVALID_REQUEST, NOT_FOUND, REPLY_PREFIX_LEN, UNAUTHORIZED,
};
use sync_core::{hash, CatalogStore, StoreError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Longest relative path accepted from a peer.
const MAX_REL_PATH_LEN: usize = 4096;

/// Copy buffer for streaming file bytes.
const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer {0} does not recognize us as a known device")]
    Unauthorized(SocketAddr),

    #[error("peer {addr} has no copy of {hash}")]
    NotFound { addr: SocketAddr, hash: String },

    #[error("peer {0} rejected the request as invalid")]
    InvalidRequest(SocketAddr),

    #[error("timed out talking to {0}")]
    Timeout(SocketAddr),

    #[error("peer {addr} sent an unusable relative path: {path}")]
    UnsafePath { addr: SocketAddr, path: String },

    #[error("downloaded bytes hash to {actual}, expected {expected}")]
    HashMismatch { expected: String, actual: String },

    #[error("catalog store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Accept loop for the transfer port.
///
/// Blocks on `accept` only up to [`ACCEPT_TIMEOUT`] per wait so the
/// shutdown flag is observed promptly; every accepted connection is
/// handled in its own task so a slow peer never stalls the listener.
pub async fn serve(
    listener: TcpListener,
    catalog: SharedCatalog,
    root: PathBuf,
    shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("file server listening on {}", addr),
        Err(_) => info!("file server listening"),
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        let (stream, addr) = match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                error!("file server accept failed: {}", e);
                continue;
            }
            Ok(Ok(conn)) => conn,
        };
        debug!("transfer connection from {}", addr);

        let catalog = catalog.clone();
        let root = root.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_request(stream, addr, catalog, &root).await {
                warn!("error handling transfer request from {}: {}", addr, e);
            }
        });
    }
    info!("file server stopped");
}

async fn handle_request(
    mut stream: TcpStream,
    addr: SocketAddr,
    catalog: SharedCatalog,
    root: &Path,
) -> Result<()> {
    let mut frame = [0u8; HASH_WIRE_LEN];
    match timeout(IO_TIMEOUT, stream.read_exact(&mut frame)).await {
        Err(_) => {
            warn!("timed out waiting for request from {}, dropping connection", addr);
            return Ok(());
        }
        Ok(read) => {
            read?;
        }
    }

    // Authorization comes before any catalog lookup.
    let authorized = {
        let cat = catalog.lock().await;
        cat.get_known_ips()?.contains(&addr.ip())
    };
    if !authorized {
        info!("rejecting transfer request from unknown device {}", addr);
        stream.write_all(UNAUTHORIZED).await?;
        return Ok(());
    }

    let Some(requested) = decode_hash_request(&frame) else {
        info!("invalid transfer request from {}", addr);
        stream.write_all(INVALID_REQUEST).await?;
        return Ok(());
    };

    let path = {
        let cat = catalog.lock().await;
        cat.get_file_path_by_hash(&requested)?
    };
    let Some(path) = path.filter(|p| p.is_file()) else {
        info!("no local copy of {} for {}", requested, addr);
        stream.write_all(NOT_FOUND).await?;
        return Ok(());
    };

    let rel = relative_wire_path(&path, root);
    info!("sending {} to {}", path.display(), addr);
    stream.write_all(&(rel.len() as u32).to_be_bytes()).await?;
    stream.write_all(rel.as_bytes()).await?;

    let mut file = tokio::fs::File::open(&path).await?;
    tokio::io::copy(&mut file, &mut stream).await?;
    stream.shutdown().await?;
    Ok(())
}

/// The path a peer should store this file under, relative to our root.
/// Files tracked from outside the root land at the peer's top level.
fn relative_wire_path(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Reject anything but plain relative components. Honest peers never
/// send absolute paths or `..`.
fn sanitize_relative(rel: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Fetch one file from a peer and register it with the catalog.
///
/// The downloaded bytes are re-hashed before registration; a mismatch
/// discards the file and fails the attempt.
pub async fn fetch_file(
    addr: SocketAddr,
    file_hash: &str,
    root: &Path,
    catalog: &SharedCatalog,
) -> Result<PathBuf, TransferError> {
    let frame =
        encode_hash_request(file_hash).ok_or(TransferError::InvalidRequest(addr))?;

    let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::Timeout(addr))??;
    stream.write_all(&frame).await?;

    let mut prefix = [0u8; REPLY_PREFIX_LEN];
    timeout(IO_TIMEOUT, stream.read_exact(&mut prefix))
        .await
        .map_err(|_| TransferError::Timeout(addr))??;

    match classify_reply(&prefix) {
        ReplyKind::Unauthorized => return Err(TransferError::Unauthorized(addr)),
        ReplyKind::NotFound => {
            return Err(TransferError::NotFound {
                addr,
                hash: file_hash.to_string(),
            })
        }
        ReplyKind::InvalidRequest => return Err(TransferError::InvalidRequest(addr)),
        ReplyKind::Payload => {}
    }

    let rel_len = u32::from_be_bytes(prefix) as usize;
    if rel_len == 0 || rel_len > MAX_REL_PATH_LEN {
        return Err(TransferError::UnsafePath {
            addr,
            path: format!("<{} byte path>", rel_len),
        });
    }
    let mut rel_buf = vec![0u8; rel_len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut rel_buf))
        .await
        .map_err(|_| TransferError::Timeout(addr))??;
    let rel = String::from_utf8(rel_buf).map_err(|_| TransferError::UnsafePath {
        addr,
        path: "<non-utf8>".into(),
    })?;
    let rel_path = sanitize_relative(&rel).ok_or_else(|| TransferError::UnsafePath {
        addr,
        path: rel.clone(),
    })?;

    let dest = root.join(rel_path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&dest).await?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = timeout(IO_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| TransferError::Timeout(addr))??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;
    drop(file);

    let actual = hash::hash_file(&dest)?;
    if actual != file_hash {
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(TransferError::HashMismatch {
            expected: file_hash.to_string(),
            actual,
        });
    }

    {
        let mut cat = catalog.lock().await;
        cat.add_file(&dest)?;
    }
    debug!("registered downloaded file {}", dest.display());
    Ok(dest)
}
