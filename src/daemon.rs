use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::config::{Config, ConfigOverrides};
use crate::context::SyncContext;
use crate::filters::SyncFilters;
use crate::http::ApiClient;
use crate::manager::SyncManager;
use crate::perm::PermissionEngine;
use crate::status::SyncStatusReporter;
use crate::store::MetadataStore;
use crate::workspace::{ensure_workspace_layout, WorkspaceLock};

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub log_path: Option<PathBuf>,
}

pub struct ThreadedDaemonHandle {
    shutdown: std::sync::mpsc::Sender<()>,
    join: Option<thread::JoinHandle<Result<()>>>,
}

impl ThreadedDaemonHandle {
    pub fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            match join.join() {
                Ok(res) => res,
                Err(_) => anyhow::bail!("syftbox daemon thread panicked"),
            }
        } else {
            Ok(())
        }
    }
}

/// Builds the shared context, runs the one-shot legacy permission migration
/// and metadata-store heal, then drives the sync manager until `shutdown`
/// fires.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<tokio::sync::Notify>,
) -> Result<()> {
    let log_path = opts.log_path.unwrap_or_else(|| daemon_log_path(&cfg));
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    ensure_workspace_layout(&cfg.data_dir, &cfg.email)?;
    let _lock = WorkspaceLock::try_lock(&cfg.data_dir)?;

    let datasites_root = cfg.data_dir.join("datasites");
    let filters = SyncFilters::load(&datasites_root)?;

    let mut store = MetadataStore::open(&cfg.data_dir)?;
    let healed = store.heal(&datasites_root).context("heal metadata store")?;
    if healed > 0 {
        crate::logging::info(format!("healed {healed} stale metadata records"));
    }

    let permissions = PermissionEngine::new();
    let migrated = permissions
        .migrate_legacy_files(&datasites_root)
        .context("migrate legacy permission files")?;
    if migrated > 0 {
        crate::logging::info(format!("migrated {migrated} legacy permission files"));
    }
    let loaded = permissions
        .load_all(&mut store, &cfg.data_dir)
        .context("load permission rules")?;
    crate::logging::info(format!("loaded rules from {loaded} permission files"));

    let server_client = ApiClient::new(&cfg.server_url, &cfg.email, None)?;
    let interval = cfg.sync_interval;

    let ctx = Arc::new(SyncContext {
        config: cfg.clone(),
        workspace_root: cfg.data_dir.clone(),
        store: Mutex::new(store),
        permissions,
        server_client,
        status: Arc::new(SyncStatusReporter::new()),
    });

    let mut manager = SyncManager::new(ctx, filters);
    manager.start_with_shutdown(shutdown, interval).await;
    Ok(())
}

/// Start a SyftBox Rust daemon in a dedicated background thread (with its own tokio runtime).
///
/// This is designed for embedding in other Rust applications that don't want to
/// own SyftBox's async lifecycle directly.
pub fn start_threaded(cfg: Config, opts: DaemonOptions) -> Result<ThreadedDaemonHandle> {
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name("syftbox-rs-daemon".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
                .context("build tokio runtime")?;

            rt.block_on(async move {
                let shutdown = Arc::new(tokio::sync::Notify::new());
                let shutdown_task = shutdown.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = shutdown_rx.recv();
                    shutdown_task.notify_waiters();
                });

                run_daemon_with_shutdown(cfg, opts, shutdown).await
            })
        })
        .context("spawn syftbox daemon thread")?;

    Ok(ThreadedDaemonHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

/// Convenience: load config with overrides (matching the CLI's precedence rules)
/// and then start a background daemon thread.
pub fn start_threaded_from_config_path(
    config_path: &std::path::Path,
    overrides: ConfigOverrides,
    opts: DaemonOptions,
) -> Result<ThreadedDaemonHandle> {
    let cfg = Config::load_with_overrides(config_path, overrides)?;
    start_threaded(cfg, opts)
}

fn daemon_log_path(cfg: &Config) -> PathBuf {
    if let Some(p) = cfg.config_path.as_ref().and_then(|p| p.parent()) {
        return p.join("logs").join("syftbox.log");
    }
    cfg.data_dir
        .join(".syftbox")
        .join("logs")
        .join("syftbox.log")
}
