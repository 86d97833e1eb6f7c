use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::change::is_permission_file;
use crate::delta;
use crate::errors::SyncError;
use crate::hash::hash_file;
use crate::perm::{Permission, PermissionEngine};
use crate::store::{FileMetadata, MetadataStore};

/// The server half of the sync protocol: a snapshot directory plus the same
/// metadata store and permission engine the client uses, reached over HTTP
/// instead of the local filesystem. Who may call these routes at all is the
/// out-of-core auth middleware's job; this router only checks *what* the
/// caller named in the `email` header may do to a given path.
pub struct ServerState {
    pub snapshot_root: PathBuf,
    pub store: Mutex<MetadataStore>,
    pub permissions: PermissionEngine,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/sync/datasites", post(list_datasites))
        .route("/sync/dir_state", post(dir_state))
        .route("/sync/get_metadata", post(get_metadata))
        .route("/sync/get_diff", post(get_diff))
        .route("/sync/apply_diff", post(apply_diff))
        .route("/sync/create", post(create_file))
        .route("/sync/delete", post(delete_file))
        .route("/sync/download", post(download_file))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Option<Arc<Notify>>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    crate::logging::info(format!("sync server listening on {addr}"));
    let app = router(state);
    match shutdown {
        Some(shutdown) => {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await
        }
        None => axum::serve(listener, app).await,
    }
    .context("sync server error")
}

fn caller_email(headers: &HeaderMap) -> String {
    headers
        .get("email")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteFileEntryDto {
    path: String,
    hash: String,
    size: u64,
    mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl RemoteFileEntryDto {
    fn from_metadata(m: &FileMetadata) -> Self {
        Self {
            path: m.path.clone(),
            hash: m.hash.clone(),
            size: m.size,
            mtime: (m.mtime_ns / 1_000_000_000) as i64,
            signature: m.signature.as_ref().map(|s| base85::encode(s)),
        }
    }
}

async fn list_datasites(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let store = state.store.lock().await;
    match store.list_datasites() {
        Ok(names) => Json(names).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Deserialize)]
struct DirStateRequest {
    dir: String,
}

async fn dir_state(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<DirStateRequest>,
) -> impl IntoResponse {
    if Path::new(&req.dir).is_absolute() {
        return error_response(StatusCode::BAD_REQUEST, "dir must be relative");
    }
    let user = caller_email(&headers);
    let store = state.store.lock().await;
    let records = match store.list(&req.dir) {
        Ok(r) => r,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    let mut out = Vec::new();
    for record in records {
        match state
            .permissions
            .query(&store, &user, &record.path, Permission::Read)
        {
            Ok(true) => out.push(RemoteFileEntryDto::from_metadata(&record)),
            Ok(false) => {}
            Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        }
    }
    Json(out).into_response()
}

#[derive(Deserialize)]
struct PathLikeRequest {
    path_like: String,
}

async fn get_metadata(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<PathLikeRequest>,
) -> impl IntoResponse {
    let user = caller_email(&headers);
    let store = state.store.lock().await;

    let records = if let Ok(Some(exact)) = store.get(&req.path_like) {
        vec![exact]
    } else {
        match store.list(&req.path_like) {
            Ok(r) => r,
            Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        }
    };

    let mut out = Vec::new();
    for record in records {
        match state
            .permissions
            .query(&store, &user, &record.path, Permission::Read)
        {
            Ok(true) => out.push(RemoteFileEntryDto::from_metadata(&record)),
            Ok(false) => {}
            Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        }
    }
    Json(out).into_response()
}

#[derive(Deserialize)]
struct GetDiffRequest {
    path: String,
    signature: String,
}

#[derive(Serialize)]
struct DiffResponseDto {
    path: String,
    diff: String,
    hash: String,
}

async fn get_diff(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<GetDiffRequest>,
) -> impl IntoResponse {
    let user = caller_email(&headers);
    let store = state.store.lock().await;
    match state
        .permissions
        .query(&store, &user, &req.path, Permission::Read)
    {
        Ok(true) => {}
        Ok(false) => return forbidden(&user, &req.path),
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
    let resolved = match resolve_one(&store, &req.path) {
        Ok(m) => m,
        Err(err) => return sync_error_response(err),
    };
    drop(store);

    let abs_path = state.snapshot_root.join(&resolved.path);
    let data = match std::fs::read(&abs_path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(&req.path),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let client_sig = match base85::decode(&req.signature) {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let patch = match delta::diff(&client_sig, &data) {
        Ok(p) => p,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    Json(DiffResponseDto {
        path: req.path.clone(),
        diff: base85::encode(&patch),
        hash: format!("{:x}", md5::compute(&data)),
    })
    .into_response()
}

#[derive(Deserialize)]
struct ApplyDiffRequest {
    path: String,
    diff: String,
    expected_hash: String,
}

#[derive(Serialize)]
struct ApplyDiffResponseDto {
    path: String,
    current_hash: String,
    previous_hash: Option<String>,
}

async fn apply_diff(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<ApplyDiffRequest>,
) -> impl IntoResponse {
    let user = caller_email(&headers);
    let resolved = {
        let store = state.store.lock().await;
        match state
            .permissions
            .query(&store, &user, &req.path, Permission::Write)
        {
            Ok(true) => {}
            Ok(false) => return forbidden(&user, &req.path),
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
        match resolve_one(&store, &req.path) {
            Ok(m) => m,
            Err(err) => return sync_error_response(err),
        }
    };

    let abs_path = state.snapshot_root.join(&resolved.path);
    let base = std::fs::read(&abs_path).unwrap_or_default();
    let previous_hash = if base.is_empty() {
        None
    } else {
        Some(format!("{:x}", md5::compute(&base)))
    };

    let patch = match base85::decode(&req.diff) {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let reconstructed = match delta::apply(&base, &patch) {
        Ok(r) => r,
        Err(err) => return error_response(StatusCode::CONFLICT, &err.to_string()),
    };

    let current_hash = format!("{:x}", md5::compute(&reconstructed));
    if current_hash != req.expected_hash {
        return error_response(
            StatusCode::CONFLICT,
            &format!(
                "hash mismatch: expected {}, got {}",
                req.expected_hash, current_hash
            ),
        );
    }

    if let Some(parent) = abs_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&abs_path, &reconstructed) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    if let Err(err) = upsert_after_write(&state, &resolved.path, &reconstructed, &abs_path).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }

    if is_permission_file(&resolved.path) {
        if let Err(err) = rebuild_permission_file(&state, &abs_path).await {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    }

    Json(ApplyDiffResponseDto {
        path: req.path,
        current_hash,
        previous_hash,
    })
    .into_response()
}

async fn create_file(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    mut multipart: axum::extract::Multipart,
) -> impl IntoResponse {
    let user = caller_email(&headers);
    let mut path: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        match field.name() {
            Some("path") => {
                path = field.text().await.ok();
            }
            Some("file") => {
                data = field.bytes().await.ok().map(|b| b.to_vec());
            }
            _ => {}
        }
    }

    let (Some(path), Some(data)) = (path, data) else {
        return error_response(StatusCode::BAD_REQUEST, "missing path or file field");
    };

    {
        let store = state.store.lock().await;
        match state
            .permissions
            .query(&store, &user, &path, Permission::Create)
        {
            Ok(true) => {}
            Ok(false) => return forbidden(&user, &path),
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
        if store.get(&path).ok().flatten().is_some() {
            return error_response(StatusCode::CONFLICT, &format!("{path} already exists"));
        }
    }

    let abs_path = state.snapshot_root.join(&path);
    if abs_path.exists() {
        return error_response(StatusCode::CONFLICT, &format!("{path} already exists"));
    }
    if let Some(parent) = abs_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    }
    if let Err(e) = std::fs::write(&abs_path, &data) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    if let Err(err) = upsert_after_write(&state, &path, &data, &abs_path).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }

    if is_permission_file(&path) {
        if let Err(err) = rebuild_permission_file(&state, &abs_path).await {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    }

    StatusCode::OK.into_response()
}

#[derive(Deserialize)]
struct PathRequest {
    path: String,
}

async fn delete_file(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<PathRequest>,
) -> impl IntoResponse {
    let user = caller_email(&headers);
    let mut store = state.store.lock().await;
    match state
        .permissions
        .query(&store, &user, &req.path, Permission::Write)
    {
        Ok(true) => {}
        Ok(false) => return forbidden(&user, &req.path),
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
    let resolved = match resolve_one(&store, &req.path) {
        Ok(m) => m,
        Err(err) => return sync_error_response(err),
    };

    let abs_path = state.snapshot_root.join(&resolved.path);
    let _ = std::fs::remove_file(&abs_path);
    if let Err(err) = store.delete(&resolved.path) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }

    if is_permission_file(&resolved.path) {
        if let Err(err) = state
            .permissions
            .rebuild_for_file(&mut store, &state.snapshot_root, &abs_path)
        {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    }
    StatusCode::OK.into_response()
}

async fn download_file(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(req): Json<PathRequest>,
) -> impl IntoResponse {
    let user = caller_email(&headers);
    let resolved = {
        let store = state.store.lock().await;
        match state
            .permissions
            .query(&store, &user, &req.path, Permission::Read)
        {
            Ok(true) => {}
            Ok(false) => return forbidden(&user, &req.path),
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
        match resolve_one(&store, &req.path) {
            Ok(m) => m,
            Err(err) => return sync_error_response(err),
        }
    };

    let abs_path = state.snapshot_root.join(&resolved.path);
    match std::fs::read(&abs_path) {
        Ok(data) => data.into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found(&req.path),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Resolves `path_like` to exactly one file record via a prefix match
/// against the store, mirroring the reference server's
/// `get_all_metadata(conn, path_like=...)` lookup: zero matches is
/// `NotFound`, more than one is `Ambiguous`.
fn resolve_one(store: &MetadataStore, path_like: &str) -> Result<FileMetadata, SyncError> {
    let mut matches = store.list(path_like).map_err(SyncError::Fatal)?;
    match matches.len() {
        0 => Err(SyncError::NotFound {
            path: path_like.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        n => Err(SyncError::Ambiguous {
            path: path_like.to_string(),
            matches: n,
        }),
    }
}

fn sync_error_response(err: SyncError) -> axum::response::Response {
    match err {
        SyncError::NotFound { path } => not_found(&path),
        SyncError::Ambiguous { path, matches } => error_response(
            StatusCode::BAD_REQUEST,
            &format!("ambiguous path {path}: {matches} candidates"),
        ),
        SyncError::Forbidden { user, path, op } => {
            error_response(StatusCode::FORBIDDEN, &format!("{user} may not {op} {path}"))
        }
        SyncError::Conflict { path } => {
            error_response(StatusCode::CONFLICT, &format!("{path} already exists"))
        }
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
    }
}

async fn rebuild_permission_file(state: &ServerState, abs_path: &Path) -> Result<()> {
    let mut store = state.store.lock().await;
    state
        .permissions
        .rebuild_for_file(&mut store, &state.snapshot_root, abs_path)
}

async fn upsert_after_write(
    state: &ServerState,
    rel_path: &str,
    data: &[u8],
    abs_path: &Path,
) -> Result<()> {
    let (hash, size, mtime_ns, signature) =
        hash_file(abs_path).map_err(|e| anyhow::anyhow!("{}: {}", e.path.display(), e.cause))?;
    debug_assert_eq!(size as usize, data.len());
    let mut store = state.store.lock().await;
    store.upsert(&crate::hash::FileRecord {
        relative_path: rel_path.to_string(),
        hash,
        size_bytes: size,
        mtime_ns,
        signature,
    })?;
    Ok(())
}

fn forbidden(user: &str, path: &str) -> axum::response::Response {
    error_response(
        StatusCode::FORBIDDEN,
        &format!("{user} may not access {path}"),
    )
}

fn not_found(path: &str) -> axum::response::Response {
    error_response(StatusCode::NOT_FOUND, &format!("not found: {path}"))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perm::{parse_permission_file, PERMISSION_FILE_NAME};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> (Arc<ServerState>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        std::fs::create_dir_all(root.join("datasites/alice@example.com/public")).unwrap();

        let mut store = MetadataStore::open_at(&root.join("metadata.db")).unwrap();
        let rules = parse_permission_file(
            "datasites/alice@example.com",
            1,
            "- path: \"**\"\n  user: \"alice@example.com\"\n  permissions: [admin, write, create, read]\n  allow: true\n",
        )
        .unwrap();
        store
            .replace_rules("datasites/alice@example.com", &rules)
            .unwrap();

        let file_path = root.join("datasites/alice@example.com/hello.txt");
        std::fs::write(&file_path, b"hello world").unwrap();
        let (hash, size, mtime_ns, signature) = hash_file(&file_path).unwrap();
        store
            .upsert(&crate::hash::FileRecord {
                relative_path: "datasites/alice@example.com/hello.txt".to_string(),
                hash,
                size_bytes: size,
                mtime_ns,
                signature,
            })
            .unwrap();

        let state = Arc::new(ServerState {
            snapshot_root: root,
            store: Mutex::new(store),
            permissions: PermissionEngine::new(),
        });
        let _ = PERMISSION_FILE_NAME;
        (state, tmp)
    }

    #[tokio::test]
    async fn dir_state_hides_files_from_unauthorized_users() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/sync/dir_state")
            .header("content-type", "application/json")
            .header("email", "mallory@example.com")
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({"dir": "datasites/alice@example.com"}))
                    .unwrap(),
            ))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let entries: Vec<RemoteFileEntryDto> = serde_json::from_slice(&bytes).unwrap();
        assert!(entries.is_empty());

        let req = Request::builder()
            .method("POST")
            .uri("/sync/dir_state")
            .header("content-type", "application/json")
            .header("email", "alice@example.com")
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({"dir": "datasites/alice@example.com"}))
                    .unwrap(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let entries: Vec<RemoteFileEntryDto> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn dir_state_rejects_absolute_path() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/sync/dir_state")
            .header("content-type", "application/json")
            .header("email", "alice@example.com")
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({"dir": "/etc/passwd"})).unwrap(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_diff_returns_not_found_for_missing_path() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/sync/get_diff")
            .header("content-type", "application/json")
            .header("email", "alice@example.com")
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "path": "datasites/alice@example.com/nope.txt",
                    "signature": ""
                }))
                .unwrap(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn creating_a_permission_file_populates_its_rules() {
        let (state, _tmp) = test_state().await;
        let app = router(state.clone());

        let body = format!(
            "--X\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\ndatasites/alice@example.com/{}\r\n--X\r\nContent-Disposition: form-data; name=\"file\"\r\n\r\n- path: \"**\"\n  user: \"bob@example.com\"\n  permissions: [read]\n  allow: true\n\r\n--X--\r\n",
            PERMISSION_FILE_NAME
        );
        let req = Request::builder()
            .method("POST")
            .uri("/sync/create")
            .header("content-type", "multipart/form-data; boundary=X")
            .header("email", "alice@example.com")
            .body(axum::body::Body::from(body))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let store = state.store.lock().await;
        let rules = store
            .rules_for_ancestors(&["datasites/alice@example.com".to_string()])
            .unwrap();
        assert!(rules.iter().any(|r| r.user == "bob@example.com"));
    }

    #[tokio::test]
    async fn delete_requires_write_permission() {
        let (state, _tmp) = test_state().await;
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/sync/delete")
            .header("content-type", "application/json")
            .header("email", "mallory@example.com")
            .body(axum::body::Body::from(
                serde_json::to_vec(
                    &serde_json::json!({"path": "datasites/alice@example.com/hello.txt"}),
                )
                .unwrap(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
