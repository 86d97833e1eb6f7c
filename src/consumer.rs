use std::path::Path;

use crate::change::{is_permission_file, ChangeKind, Direction};
use crate::context::SyncContext;
use crate::delta;
use crate::errors::SyncError;
use crate::hash::{hash_file, FileRecord};
use crate::queue::{QueueEntry, SyncQueue};
use crate::status::FileSyncState;

/// Drains one eligible queue entry at a time and dispatches by event kind
/// × push/pull direction. Intra-datasite concurrency is intentionally
/// absent: one entry completes (or times out) before the next starts.
pub async fn consume_all(ctx: &SyncContext, queue: &mut SyncQueue, now_ns: i128) -> Result<(), SyncError> {
    while let Some(entry) = queue.pop_eligible(now_ns) {
        let path = entry.event.path.clone();
        match consume_one(ctx, &entry).await {
            Ok(()) => ctx.status.record(&path, FileSyncState::Synced),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) if err.is_retryable() => {
                ctx.status.record(&path, FileSyncState::Pending);
                queue.retry(entry, now_ns);
                if queue.is_dead_lettered(&path) {
                    ctx.status.record(&path, FileSyncState::DeadLettered);
                }
            }
            Err(err) => {
                ctx.status
                    .record(&path, FileSyncState::Failed { reason: err.to_string() });
            }
        }
    }
    Ok(())
}

async fn consume_one(ctx: &SyncContext, entry: &QueueEntry) -> Result<(), SyncError> {
    let event = &entry.event;
    match (event.kind, event.direction) {
        (ChangeKind::Create, Direction::Push) | (ChangeKind::Write, Direction::Push) => {
            push_file(ctx, &event.path).await
        }
        (ChangeKind::Create, Direction::Pull) | (ChangeKind::Write, Direction::Pull) => {
            pull_file(ctx, &event.path).await
        }
        (ChangeKind::Delete, Direction::Push) => {
            ctx.server_client.delete(&event.path).await?;
            let mut store = ctx.store.lock().await;
            store
                .delete(&event.path)
                .map_err(|e| SyncError::Fatal(e))?;
            if is_permission_file(&event.path) {
                let abs_path = ctx.workspace_root.join(&event.path);
                ctx.permissions
                    .rebuild_for_file(&mut store, &ctx.workspace_root, &abs_path)
                    .map_err(SyncError::Fatal)?;
            }
            Ok(())
        }
        (ChangeKind::Delete, Direction::Pull) => {
            let abs_path = ctx.workspace_root.join(&event.path);
            let _ = std::fs::remove_file(&abs_path);
            let mut store = ctx.store.lock().await;
            store
                .delete(&event.path)
                .map_err(|e| SyncError::Fatal(e))?;
            if is_permission_file(&event.path) {
                ctx.permissions
                    .rebuild_for_file(&mut store, &ctx.workspace_root, &abs_path)
                    .map_err(SyncError::Fatal)?;
            }
            Ok(())
        }
    }
}

async fn push_file(ctx: &SyncContext, rel_path: &str) -> Result<(), SyncError> {
    let abs_path = ctx.workspace_root.join(rel_path);
    let (hash, size, mtime_ns, signature) = hash_file(&abs_path).map_err(|e| SyncError::ScanError {
        path: e.path,
        cause: e.cause,
    })?;
    let data = std::fs::read(&abs_path).map_err(|e| SyncError::Transport(e.into()))?;

    let remote_entries = ctx.server_client.get_metadata(rel_path).await?;
    let remote = remote_entries.into_iter().find(|e| e.path == rel_path);

    match remote {
        None => {
            ctx.server_client.create(rel_path, data).await?;
        }
        Some(entry) => {
            let remote_sig = entry
                .signature_bytes()
                .map_err(SyncError::Transport)?
                .unwrap_or_default();
            let patch = delta::diff(&remote_sig, &data)?;
            ctx.server_client.apply_diff(rel_path, &patch, &hash).await?;
        }
    }

    let mut store = ctx.store.lock().await;
    store
        .upsert(&FileRecord {
            relative_path: rel_path.to_string(),
            hash,
            size_bytes: size,
            mtime_ns,
            signature,
        })
        .map_err(SyncError::Fatal)?;
    if is_permission_file(rel_path) {
        ctx.permissions
            .rebuild_for_file(&mut store, &ctx.workspace_root, &abs_path)
            .map_err(SyncError::Fatal)?;
    }
    Ok(())
}

async fn pull_file(ctx: &SyncContext, rel_path: &str) -> Result<(), SyncError> {
    let abs_path = ctx.workspace_root.join(rel_path);
    let local_signature = if abs_path.exists() {
        let data = std::fs::read(&abs_path).map_err(|e| SyncError::Transport(e.into()))?;
        delta::signature(&data)
    } else {
        Vec::new()
    };

    let resp = ctx.server_client.get_diff(rel_path, &local_signature).await?;
    let patch = resp.diff_bytes().map_err(SyncError::Transport)?;

    let base = if abs_path.exists() {
        std::fs::read(&abs_path).map_err(|e| SyncError::Transport(e.into()))?
    } else {
        Vec::new()
    };
    let reconstructed = delta::apply(&base, &patch)?;

    let actual_hash = format!("{:x}", md5::compute(&reconstructed));
    if actual_hash != resp.hash {
        return Err(SyncError::HashMismatch {
            path: rel_path.to_string(),
            expected: resp.hash,
            actual: actual_hash,
        });
    }

    write_resolving_parent(&abs_path, &reconstructed).map_err(|e| SyncError::Transport(e.into()))?;

    let signature = delta::signature(&reconstructed);
    let mtime_ns = std::fs::metadata(&abs_path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0);

    let mut store = ctx.store.lock().await;
    store
        .upsert(&FileRecord {
            relative_path: rel_path.to_string(),
            hash: actual_hash,
            size_bytes: reconstructed.len() as u64,
            mtime_ns,
            signature,
        })
        .map_err(SyncError::Fatal)?;
    if is_permission_file(rel_path) {
        ctx.permissions
            .rebuild_for_file(&mut store, &ctx.workspace_root, &abs_path)
            .map_err(SyncError::Fatal)?;
    }
    Ok(())
}

fn write_resolving_parent(abs_path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = abs_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = abs_path.with_extension(format!("syft.tmp.{}", std::process::id()));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, abs_path)
}
