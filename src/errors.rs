use std::path::PathBuf;

use thiserror::Error;

/// The fixed error taxonomy shared by every layer of the sync engine.
///
/// Call sites that don't need to match on a particular kind keep using
/// `anyhow::Result` with `.context(...)`, the same as the rest of this
/// crate; `SyncError` implements `std::error::Error` so it composes with
/// that the same way any other error type would.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("ambiguous lookup for {path}: {matches} candidates")]
    Ambiguous { path: String, matches: usize },

    #[error("forbidden: {user} may not {op} {path}")]
    Forbidden {
        user: String,
        path: String,
        op: &'static str,
    },

    #[error("conflict: {path} already exists")]
    Conflict { path: String },

    #[error("hash mismatch on {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("patch corrupt for {path}: {reason}")]
    PatchCorrupt { path: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("scan error at {path}: {cause}")]
    ScanError { path: PathBuf, cause: String },

    #[error("invalid permission file {path}: {reason}")]
    PermissionFileInvalid { path: PathBuf, reason: String },

    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_))
    }

    /// Whether the sync consumer should re-enqueue the entry that raised
    /// this error, versus recording it and moving on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
