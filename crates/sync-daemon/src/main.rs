//! sync-daemon: Headless peer-to-peer file synchronization daemon.
//!
//! Runs two TCP listeners (file transfer + catalog sync), a filesystem
//! watcher and a reconciliation loop over one shared catalog. The
//! subcommands cover setup: ingesting directories, issuing and redeeming
//! pairing tokens, unsyncing and deleting.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use sync_daemon::config::{DaemonConfig, StoreKind};
use sync_daemon::reconcile::Reconciler;
use sync_daemon::watcher::{apply_event, FileWatcher};
use sync_daemon::{catalog_sync, net, transfer, SharedCatalog};

use sync_core::pairing::{self, TokenPayload};
use sync_core::{hash, CatalogSnapshot, CatalogStore};

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Peer-to-peer file synchronization daemon")]
struct Cli {
    /// Sync root directory (downloads land here)
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Override the file transfer port
    #[arg(long)]
    transfer_port: Option<u16>,

    /// Override the catalog sync port
    #[arg(long)]
    catalog_port: Option<u16>,

    /// Override the catalog backend
    #[arg(long, value_enum)]
    store: Option<StoreKind>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon
    Run,
    /// Ingest a directory and watch it for changes
    Add {
        /// Directory to share
        dir: PathBuf,
    },
    /// Print a pairing token for another device to join with
    Pair,
    /// Join a peer using its pairing token
    Join {
        /// The magnet token printed by `pair` on the other device
        token: String,
    },
    /// Stop syncing a directory (keeps the files on disk)
    Unsync {
        /// Directory to stop sharing
        dir: PathBuf,
    },
    /// Delete a file here and on every synced device
    Remove {
        /// File to delete everywhere
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG; --verbose flips the default filter to debug.
    let default_filter = if cli.verbose {
        "debug,sync_daemon=debug"
    } else {
        "info,sync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = DaemonConfig::load_or_default(&cli.root)?;
    if let Some(port) = cli.transfer_port {
        config.transfer_port = port;
    }
    if let Some(port) = cli.catalog_port {
        config.catalog_port = port;
    }
    if let Some(store) = cli.store {
        config.store = store;
    }

    match cli.command {
        Command::Run => run(config).await,
        Command::Add { dir } => cmd_add(&config, &dir).await,
        Command::Pair => cmd_pair(&config),
        Command::Join { token } => cmd_join(&config, &token).await,
        Command::Unsync { dir } => cmd_unsync(&config, &dir).await,
        Command::Remove { path } => cmd_remove(&config, &path).await,
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    info!("starting sync daemon");
    info!("sync root: {}", config.root.display());
    config.save()?;

    let catalog = open_shared(&config)?;
    let my_ip = net::local_ip();
    info!("local address: {}", my_ip);
    {
        let mut cat = catalog.lock().await;
        cat.add_device(my_ip)?;
    }

    // The only fatal startup condition: the listeners must bind.
    let transfer_listener = TcpListener::bind((config.listen_addr, config.transfer_port))
        .await
        .with_context(|| format!("cannot bind transfer port {}", config.transfer_port))?;
    let catalog_listener = TcpListener::bind((config.listen_addr, config.catalog_port))
        .await
        .with_context(|| format!("cannot bind catalog port {}", config.catalog_port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();

    tokio::spawn(transfer::serve(
        transfer_listener,
        catalog.clone(),
        config.root.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(catalog_sync::serve(
        catalog_listener,
        catalog.clone(),
        config.data_dir(),
        my_ip,
        config.catalog_port,
        wakeup_tx,
        shutdown_rx.clone(),
    ));

    let reconciler = Reconciler {
        catalog: catalog.clone(),
        root: config.root.clone(),
        my_ip,
        transfer_port: config.transfer_port,
        interval: Duration::from_secs(config.reconcile_interval_secs),
    };
    tokio::spawn(reconciler.run(wakeup_rx, shutdown_rx));

    let mut watcher = FileWatcher::new()?;
    let dirs = {
        let cat = catalog.lock().await;
        cat.get_local_directories()?
    };
    for dir in &dirs {
        match watcher.watch(dir) {
            Ok(()) => info!("watching {}", dir.display()),
            Err(e) => warn!("cannot watch {}: {}", dir.display(), e),
        }
    }

    info!("daemon running, press Ctrl+C to stop");
    loop {
        tokio::select! {
            Some(event) = watcher.event_rx().recv() => {
                if apply_event(&event, &catalog).await {
                    catalog_sync::notify_devices(&catalog, my_ip, config.catalog_port).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    info!("shutting down");
    Ok(())
}

fn open_shared(config: &DaemonConfig) -> Result<SharedCatalog> {
    let store = config.open_store()?;
    Ok(Arc::new(Mutex::new(store)))
}

/// Walk a directory and ingest every regular file, skipping dot-paths.
/// Returns how many files were added.
async fn ingest_dir(catalog: &SharedCatalog, dir: &Path) -> usize {
    let mut count = 0;
    let mut cat = catalog.lock().await;
    let entries = WalkDir::new(dir).into_iter().filter_entry(|e| {
        e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
    });
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry under {}: {}", dir.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match cat.add_file(entry.path()) {
            Ok(file_hash) => {
                debug!("added {} ({})", entry.path().display(), file_hash);
                count += 1;
            }
            Err(e) => warn!("cannot add {}: {}", entry.path().display(), e),
        }
    }
    count
}

async fn cmd_add(config: &DaemonConfig, dir: &Path) -> Result<()> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", dir.display()))?;
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let catalog = open_shared(config)?;
    let count = ingest_dir(&catalog, &dir).await;
    {
        let mut cat = catalog.lock().await;
        cat.add_directory(&dir)?;
    }
    info!("added {} file(s) from {}", count, dir.display());

    catalog_sync::notify_devices(&catalog, net::local_ip(), config.catalog_port).await;
    Ok(())
}

fn cmd_pair(config: &DaemonConfig) -> Result<()> {
    let store = config.open_store()?;
    let snapshot = CatalogSnapshot::from_store(store.as_ref())?;

    let key = pairing::generate_key();
    let payload = TokenPayload::new(
        net::local_ip().to_string(),
        hash::hash_bytes(&snapshot.to_bytes()),
    );
    let token = pairing::generate_token(&key, &payload, &config.display_name);

    println!("{token}");
    println!("This link contains the encryption key; share it over a channel you trust.");
    Ok(())
}

async fn cmd_join(config: &DaemonConfig, token: &str) -> Result<()> {
    let (payload, _key) = pairing::decode_token(token)?;
    let peer_ip: IpAddr = payload
        .addr
        .parse()
        .with_context(|| format!("token carries an unusable address: {}", payload.addr))?;
    info!("pairing with {} (device {})", peer_ip, payload.device_id);

    let catalog = open_shared(config)?;
    {
        let mut cat = catalog.lock().await;
        cat.add_device(peer_ip)?;
    }

    catalog_sync::download_snapshot(peer_ip, config.catalog_port, &catalog, &config.data_dir())
        .await?;

    // Fold our own directories in so the merged view is complete on
    // both sides before reconciling.
    let dirs = {
        let cat = catalog.lock().await;
        cat.get_local_directories()?
    };
    for dir in dirs {
        ingest_dir(&catalog, &dir).await;
    }

    let reconciler = Reconciler::new(
        catalog.clone(),
        config.root.clone(),
        config.transfer_port,
        Duration::from_secs(config.reconcile_interval_secs),
    );
    reconciler.reconcile().await;
    reconciler.notify_devices(config.catalog_port).await;

    info!("paired with {}", peer_ip);
    Ok(())
}

async fn cmd_unsync(config: &DaemonConfig, dir: &Path) -> Result<()> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", dir.display()))?;

    let catalog = open_shared(config)?;
    let mut cat = catalog.lock().await;
    cat.remove_directory(&dir)?;

    let mut count = 0;
    for entry in WalkDir::new(&dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry under {}: {}", dir.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Err(e) = cat.unsync_file(entry.path()) {
            warn!("cannot unsync {}: {}", entry.path().display(), e);
        } else {
            count += 1;
        }
    }
    info!("stopped syncing {} file(s) under {}", count, dir.display());
    Ok(())
}

async fn cmd_remove(config: &DaemonConfig, path: &Path) -> Result<()> {
    let catalog = open_shared(config)?;

    let file_hash = {
        let cat = catalog.lock().await;
        cat.get_file_hash_by_path(path)?
    };
    let Some(file_hash) = file_hash else {
        bail!("{} is not a tracked file", path.display());
    };

    {
        let mut cat = catalog.lock().await;
        cat.remove_file(&file_hash)?;
        cat.remove_file_by_hash(&file_hash)?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => info!("deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} already absent", path.display());
        }
        Err(e) => warn!("cannot delete {}: {}", path.display(), e),
    }

    catalog_sync::notify_devices(&catalog, net::local_ip(), config.catalog_port).await;
    info!("{} tombstoned everywhere", file_hash);
    Ok(())
}
