use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::change::{detect_changes, LocalEntry, RemoteEntry};
use crate::consumer::consume_all;
use crate::context::SyncContext;
use crate::errors::SyncError;
use crate::filters::SyncFilters;
use crate::hash::scan_tree;
use crate::logging;
use crate::perm::Permission;
use crate::queue::SyncQueue;

/// Periodic driver: enumerates datasites, runs the change detector against
/// each, feeds events into the queue, and drains it. Responds to a
/// cooperative stop flag checked between queue entries and between cycles.
pub struct SyncManager {
    ctx: Arc<SyncContext>,
    filters: SyncFilters,
    previously_tracked: HashSet<String>,
}

impl SyncManager {
    pub fn new(ctx: Arc<SyncContext>, filters: SyncFilters) -> Self {
        Self {
            ctx,
            filters,
            previously_tracked: HashSet::new(),
        }
    }

    /// Runs cycles on `interval` until `shutdown` is notified. A `Fatal`
    /// error breaks the loop; everything else is logged and the loop
    /// continues.
    pub async fn start_with_shutdown(&mut self, shutdown: Arc<Notify>, interval: Duration) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    logging::info("sync manager stopping");
                    return;
                }
                result = self.run_single_cycle() => {
                    match result {
                        Ok(()) => self.ctx.status.clear_cycle_error(),
                        Err(err) if err.is_fatal() => {
                            logging::error(&format!("sync manager terminating: {err}"));
                            self.ctx.status.record_cycle_error(err.to_string());
                            return;
                        }
                        Err(err) => {
                            logging::error(&format!("sync cycle failed: {err}"));
                            self.ctx.status.record_cycle_error(err.to_string());
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.notified() => {
                    logging::info("sync manager stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    pub async fn run_single_cycle(&mut self) -> Result<(), SyncError> {
        let mut datasites = self
            .ctx
            .server_client
            .list_datasites()
            .await
            .unwrap_or_default();
        let own = self.ctx.config.email.clone();
        if !datasites.iter().any(|d| d == &own) {
            datasites.push(own);
        }

        let mut queue = SyncQueue::new();
        for datasite in &datasites {
            if let Err(err) = self.enqueue_datasite_changes(datasite, &mut queue).await {
                logging::error(&format!("change detection failed for {datasite}: {err}"));
            }
        }

        consume_all(&self.ctx, &mut queue, now_ns()).await
    }

    async fn enqueue_datasite_changes(
        &mut self,
        datasite: &str,
        queue: &mut SyncQueue,
    ) -> Result<(), SyncError> {
        let datasite_rel = format!("datasites/{datasite}");
        let datasite_abs = self.ctx.workspace_root.join(&datasite_rel);

        let local: Vec<LocalEntry> = if datasite_abs.exists() {
            scan_tree(&datasite_abs, &self.filters)
                .filter_map(|r| r.ok())
                .map(|r| LocalEntry {
                    path: format!("{datasite_rel}/{}", r.relative_path),
                    hash: r.hash,
                    size_bytes: r.size_bytes,
                    mtime_ns: r.mtime_ns,
                })
                .collect()
        } else {
            Vec::new()
        };

        let remote: Vec<RemoteEntry> = self
            .ctx
            .server_client
            .dir_state(&datasite_rel)
            .await?
            .into_iter()
            .map(|e| RemoteEntry {
                path: e.path,
                hash: e.hash,
                size_bytes: e.size,
                mtime_ns: e.mtime as i128 * 1_000_000_000,
            })
            .collect();

        let visible_local: Vec<LocalEntry> = {
            let store = self.ctx.store.lock().await;
            local
                .into_iter()
                .filter(|e| {
                    self.ctx
                        .permissions
                        .query(&store, &self.ctx.config.email, &e.path, Permission::Read)
                        .unwrap_or(false)
                })
                .collect()
        };

        let events = detect_changes(&visible_local, &remote, &self.previously_tracked, now_ns());

        self.previously_tracked = visible_local
            .iter()
            .map(|e| e.path.clone())
            .chain(remote.iter().map(|e| e.path.clone()))
            .collect();

        for event in events {
            queue.push(event);
        }
        Ok(())
    }
}

fn now_ns() -> i128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0)
}
