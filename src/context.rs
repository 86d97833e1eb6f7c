use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::http::ApiClient;
use crate::perm::PermissionEngine;
use crate::status::SyncStatusReporter;
use crate::store::MetadataStore;

/// The small typed bundle every sync-engine component needs, replacing an
/// ad-hoc shared-state container reached by arbitrary keys: config,
/// workspace paths, the metadata store handle, the server client, and the
/// status reporter, passed by reference.
pub struct SyncContext {
    pub config: Config,
    pub workspace_root: PathBuf,
    pub store: Mutex<MetadataStore>,
    pub permissions: PermissionEngine,
    pub server_client: ApiClient,
    pub status: Arc<SyncStatusReporter>,
}

impl SyncContext {
    pub fn datasites_root(&self) -> PathBuf {
        self.workspace_root.join("datasites")
    }
}
