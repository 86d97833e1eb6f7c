use std::collections::HashMap;
use std::sync::Mutex;

/// A file's last-known sync outcome, kept in-process for whatever embeds
/// this crate to poll — no HTTP surface of its own, since the client's
/// local control-plane API is an out-of-core collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum FileSyncState {
    Synced,
    Pending,
    Failed { reason: String },
    DeadLettered,
}

#[derive(Default)]
pub struct SyncStatusReporter {
    files: Mutex<HashMap<String, FileSyncState>>,
    last_cycle_error: Mutex<Option<String>>,
}

impl SyncStatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &str, state: FileSyncState) {
        self.files.lock().unwrap().insert(path.to_string(), state);
    }

    pub fn get(&self, path: &str) -> Option<FileSyncState> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn record_cycle_error(&self, message: impl Into<String>) {
        *self.last_cycle_error.lock().unwrap() = Some(message.into());
    }

    pub fn clear_cycle_error(&self) {
        *self.last_cycle_error.lock().unwrap() = None;
    }

    pub fn last_cycle_error(&self) -> Option<String> {
        self.last_cycle_error.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> HashMap<String, FileSyncState> {
        self.files.lock().unwrap().clone()
    }
}
