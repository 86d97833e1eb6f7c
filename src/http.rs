use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// Client for the sync server's HTTP surface. Carries the caller's email
/// and an optional bearer token verbatim — issuing and refreshing that
/// token is the out-of-core auth middleware's job, not this client's.
#[derive(Clone)]
pub struct ApiClient {
    base: String,
    http: HttpClient,
    user: String,
    bearer_token: Option<String>,
}

impl ApiClient {
    pub fn new(base: &str, user: &str, bearer_token: Option<&str>) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            user: user.to_string(),
            bearer_token: bearer_token.map(str::to_string),
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header("email", &self.user);
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn list_datasites(&self) -> Result<Vec<String>, SyncError> {
        let url = format!("{}/sync/datasites", self.base);
        let resp = self
            .request(self.http.post(&url))
            .send()
            .await
            .map_err(transport_err)?;
        map_json(resp, "sync/datasites").await
    }

    pub async fn dir_state(&self, dir: &str) -> Result<Vec<RemoteFileEntry>, SyncError> {
        let url = format!("{}/sync/dir_state", self.base);
        let resp = self
            .request(self.http.post(&url))
            .json(&DirStateRequest { dir: dir.to_string() })
            .send()
            .await
            .map_err(transport_err)?;
        map_json(resp, "sync/dir_state").await
    }

    pub async fn get_metadata(&self, path_like: &str) -> Result<Vec<RemoteFileEntry>, SyncError> {
        let url = format!("{}/sync/get_metadata", self.base);
        let resp = self
            .request(self.http.post(&url))
            .json(&PathLikeRequest {
                path_like: path_like.to_string(),
            })
            .send()
            .await
            .map_err(transport_err)?;
        map_json(resp, "sync/get_metadata").await
    }

    pub async fn get_diff(&self, path: &str, signature: &[u8]) -> Result<DiffResponse, SyncError> {
        let url = format!("{}/sync/get_diff", self.base);
        let resp = self
            .request(self.http.post(&url))
            .json(&GetDiffRequest {
                path: path.to_string(),
                signature: base85::encode(signature),
            })
            .send()
            .await
            .map_err(transport_err)?;
        map_json(resp, "sync/get_diff").await
    }

    pub async fn apply_diff(
        &self,
        path: &str,
        diff: &[u8],
        expected_hash: &str,
    ) -> Result<ApplyDiffResponse, SyncError> {
        let url = format!("{}/sync/apply_diff", self.base);
        let resp = self
            .request(self.http.post(&url))
            .json(&ApplyDiffRequest {
                path: path.to_string(),
                diff: base85::encode(diff),
                expected_hash: expected_hash.to_string(),
            })
            .send()
            .await
            .map_err(transport_err)?;
        map_json(resp, "sync/apply_diff").await
    }

    pub async fn create(&self, path: &str, data: Vec<u8>) -> Result<(), SyncError> {
        let url = format!("{}/sync/create", self.base);
        let part = reqwest::multipart::Part::bytes(data).file_name(path.to_string());
        let form = reqwest::multipart::Form::new()
            .text("path", path.to_string())
            .part("file", part);
        let resp = self
            .request(self.http.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(transport_err)?;
        map_status(resp, path, "create").await
    }

    pub async fn delete(&self, path: &str) -> Result<(), SyncError> {
        let url = format!("{}/sync/delete", self.base);
        let resp = self
            .request(self.http.post(&url))
            .json(&PathRequest { path: path.to_string() })
            .send()
            .await
            .map_err(transport_err)?;
        map_status(resp, path, "delete").await
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        let url = format!("{}/sync/download", self.base);
        let resp = self
            .request(self.http.post(&url))
            .json(&PathRequest { path: path.to_string() })
            .send()
            .await
            .map_err(transport_err)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound {
                path: path.to_string(),
            });
        }
        if status == StatusCode::FORBIDDEN {
            return Err(SyncError::Forbidden {
                user: String::new(),
                path: path.to_string(),
                op: "download",
            });
        }
        if !status.is_success() {
            return Err(transport_err(anyhow::anyhow!("download failed: {status}")));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(transport_err)
    }
}

fn transport_err(err: impl Into<anyhow::Error>) -> SyncError {
    SyncError::Transport(err.into())
}

async fn map_status(resp: Response, path: &str, op: &'static str) -> Result<(), SyncError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => Err(SyncError::NotFound {
            path: path.to_string(),
        }),
        StatusCode::FORBIDDEN => Err(SyncError::Forbidden {
            user: String::new(),
            path: path.to_string(),
            op,
        }),
        StatusCode::CONFLICT => Err(SyncError::Conflict {
            path: path.to_string(),
        }),
        _ => Err(transport_err(anyhow::anyhow!("{op} failed: {status}"))),
    }
}

async fn map_json<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T, SyncError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.map_err(transport_err);
    }
    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::FORBIDDEN => Err(SyncError::Forbidden {
            user: String::new(),
            path: op.to_string(),
            op: "read",
        }),
        StatusCode::NOT_FOUND => Err(SyncError::NotFound { path: op.to_string() }),
        _ => Err(transport_err(anyhow::anyhow!("{op} failed: {status} {text}"))),
    }
}

#[derive(Debug, Serialize)]
struct DirStateRequest {
    dir: String,
}

#[derive(Debug, Serialize)]
struct PathLikeRequest {
    path_like: String,
}

#[derive(Debug, Serialize)]
struct PathRequest {
    path: String,
}

#[derive(Debug, Serialize)]
struct GetDiffRequest {
    path: String,
    signature: String,
}

#[derive(Debug, Serialize)]
struct ApplyDiffRequest {
    path: String,
    diff: String,
    expected_hash: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteFileEntry {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub mtime: i64,
    #[serde(default)]
    pub signature: Option<String>,
}

impl RemoteFileEntry {
    pub fn signature_bytes(&self) -> Result<Option<Vec<u8>>> {
        self.signature
            .as_deref()
            .map(|s| base85::decode(s).context("decode signature payload"))
            .transpose()
    }
}

#[derive(Debug, Deserialize)]
pub struct DiffResponse {
    pub path: String,
    pub diff: String,
    pub hash: String,
}

impl DiffResponse {
    pub fn diff_bytes(&self) -> Result<Vec<u8>> {
        base85::decode(&self.diff).context("decode diff payload")
    }
}

#[derive(Debug, Deserialize)]
pub struct ApplyDiffResponse {
    pub path: String,
    pub current_hash: String,
    pub previous_hash: Option<String>,
}
