//! Dropbox API client
//!
//! [`DropboxClient`] owns one [`RequestExecutor`] and one
//! [`UploadBatchManager`]. Besides the batch workflow it exposes the plain
//! endpoints (downloads, shared links, token check), each of which is a
//! single executor call followed by a body copy or a one-field parse.

use crate::batch::{CommitOptions, FileMetadata, PendingCommit, PollOptions, UploadBatchManager};
use crate::error::{ApiError, Error, ErrorBody, Result};
use crate::http::{ReqwestTransport, Response, Transport, DEFAULT_MAX_CONNECTIONS_PER_HOST};
use crate::request::{RequestExecutor, RequestSpec, RetryPolicy};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Base URL of JSON-body (RPC) endpoints
pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com/2";

/// Base URL of content endpoints (uploads and downloads)
pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com/2";

/// Query echoed back by `check/user` when the token is valid
const VALIDATION_QUERY: &str = "dropline";

/// API hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api_url: String,
    pub content_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            content_url: DEFAULT_CONTENT_URL.to_string(),
        }
    }
}

impl Endpoints {
    /// Serve both endpoint families from one base URL
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            api_url: format!("{}/2", base),
            content_url: format!("{}/2", base),
        }
    }

    pub fn api(&self, route: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), route)
    }

    pub fn content(&self, route: &str) -> String {
        format!("{}/{}", self.content_url.trim_end_matches('/'), route)
    }
}

/// Executor, hosts and token shared by everything that talks to the API
pub struct ApiSession {
    executor: RequestExecutor,
    endpoints: Endpoints,
    token: String,
}

impl ApiSession {
    pub fn new(executor: RequestExecutor, endpoints: Endpoints, token: impl Into<String>) -> Self {
        Self {
            executor,
            endpoints,
            token: token.into(),
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Authorized request to a JSON-body endpoint
    pub fn rpc(&self, route: &str) -> Result<RequestSpec> {
        self.executor
            .post(self.endpoints.api(route))
            .bearer(&self.token)
    }

    /// Authorized request to a content endpoint
    pub fn content(&self, route: &str) -> Result<RequestSpec> {
        self.executor
            .post(self.endpoints.content(route))
            .bearer(&self.token)
    }
}

/// Builder for [`DropboxClient`]
pub struct DropboxClientBuilder {
    token: String,
    endpoints: Endpoints,
    policy: RetryPolicy,
    max_connections_per_host: usize,
    timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
}

impl DropboxClientBuilder {
    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_connections_per_host(mut self, limit: usize) -> Self {
        self.max_connections_per_host = limit;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the `reqwest` transport, e.g. with a recording one
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<DropboxClient> {
        if self.token.trim().is_empty() {
            return Err(Error::InvalidInput("Access token cannot be empty".to_string()));
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                self.max_connections_per_host,
                self.timeout,
            )?),
        };
        let executor = RequestExecutor::with_policy(transport, self.policy);
        let session = Arc::new(ApiSession::new(executor, self.endpoints, self.token));

        Ok(DropboxClient {
            batch: UploadBatchManager::new(session.clone()),
            session,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CheckUserReply {
    result: String,
}

#[derive(Debug, Deserialize)]
struct SharedLinkReply {
    url: String,
}

/// Client for the Dropbox HTTP API
pub struct DropboxClient {
    session: Arc<ApiSession>,
    batch: UploadBatchManager,
}

impl DropboxClient {
    /// Client with default hosts, retry policy and connection limit
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::builder(token).build()
    }

    pub fn builder(token: impl Into<String>) -> DropboxClientBuilder {
        DropboxClientBuilder {
            token: token.into(),
            endpoints: Endpoints::default(),
            policy: RetryPolicy::default(),
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            timeout: None,
            transport: None,
        }
    }

    pub fn session(&self) -> &Arc<ApiSession> {
        &self.session
    }

    /// Upload batch owned by this client
    pub fn batch(&self) -> &UploadBatchManager {
        &self.batch
    }

    /// Check that the token is accepted by asking the API to echo a query.
    pub async fn validate(&self) -> Result<()> {
        debug!("Validating token");

        let spec = self
            .session
            .rpc("check/user")?
            .json(&json!({ "query": VALIDATION_QUERY }))?;
        let reply: CheckUserReply = self.session.executor().execute(&spec).await?.json().await?;

        if reply.result == VALIDATION_QUERY {
            debug!("Token is valid");
            Ok(())
        } else {
            Err(Error::InvalidToken)
        }
    }

    /// Download the file at `remote_path`; defaults to its basename in the
    /// current directory.
    pub async fn download_file(&self, remote_path: &str, local_path: Option<&Path>) -> Result<PathBuf> {
        let local = local_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_local_path(remote_path));
        info!("Downloading {}", display_name(&local));
        debug!("from {}", remote_path);

        let spec = self
            .session
            .content("files/download")?
            .api_arg(&json!({ "path": remote_path }))?;
        self.download_to(&spec, &local).await
    }

    /// Download a whole folder as a zip archive
    pub async fn download_folder(&self, remote_path: &str, local_path: Option<&Path>) -> Result<PathBuf> {
        let local = local_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_local_path(remote_path));
        info!("Downloading {}", display_name(&local));
        debug!("from {}", remote_path);

        let spec = self
            .session
            .content("files/download_zip")?
            .api_arg(&json!({ "path": remote_path }))?;
        self.download_to(&spec, &local).await
    }

    /// Download the file behind a shared link
    pub async fn download_shared_link(&self, shared_link: &str, local_path: Option<&Path>) -> Result<PathBuf> {
        let local = local_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_local_path(strip_query(shared_link)));
        info!("Downloading {}", display_name(&local));
        debug!("from {}", shared_link);

        let spec = self
            .session
            .content("sharing/get_shared_link_file")?
            .api_arg(&json!({ "url": shared_link }))?;
        self.download_to(&spec, &local).await
    }

    /// Upload a file in a single request and commit it right away
    pub async fn upload_single(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        options: &CommitOptions,
    ) -> Result<FileMetadata> {
        let local_path = local_path.as_ref();
        if !tokio::fs::try_exists(local_path).await.unwrap_or(false) {
            return Err(Error::LocalFileNotFound(local_path.to_path_buf()));
        }

        info!("Uploading {}", display_name(local_path));
        debug!("to {}", remote_path);

        let content = tokio::fs::read(local_path).await?;
        let spec = self
            .session
            .content("files/upload")?
            .api_arg(&json!({
                "path": remote_path,
                "mode": options.mode,
                "autorename": options.autorename,
                "mute": options.mute,
            }))?
            .bytes(content)?;

        self.session.executor().execute(&spec).await?.json().await
    }

    /// Upload a file into a session and queue it in the batch
    pub async fn begin_upload(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        options: &CommitOptions,
    ) -> Result<PendingCommit> {
        self.batch.begin_upload(local_path, remote_path, options).await
    }

    /// Commit everything queued with [`begin_upload`](Self::begin_upload)
    pub async fn finish_batch(&self, options: &PollOptions) -> Result<Vec<FileMetadata>> {
        self.batch.finish_batch(options).await
    }

    /// Create a shared link for `remote_path`, reusing an existing one.
    pub async fn create_shared_link(&self, remote_path: &str) -> Result<String> {
        info!("Creating shared link for file {}", basename(remote_path));
        debug!("Full path is {}", remote_path);

        // 409 carries the existing link when one is already there
        let spec = self
            .session
            .rpc("sharing/create_shared_link_with_settings")?
            .json(&json!({ "path": remote_path }))?
            .ok_statuses(&[StatusCode::OK, StatusCode::CONFLICT]);
        let response = self.session.executor().execute(&spec).await?;

        if response.status() == StatusCode::OK {
            let reply: SharedLinkReply = response.json().await?;
            return Ok(reply.url);
        }

        let status = response.status();
        let body: Value = response.json().await?;
        let summary = body
            .get("error_summary")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if summary.contains("shared_link_already_exists") {
            warn!(
                "Shared link already exists for {}, using existing link",
                basename(remote_path)
            );
            body.pointer("/error/shared_link_already_exists/metadata/url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ApiError::new(status, ErrorBody::Json(body.clone())).into())
        } else if summary.contains("not_found") {
            Err(Error::NotFound(format!("Path {} does not exist", remote_path)))
        } else {
            Err(ApiError::new(status, ErrorBody::Json(body)).into())
        }
    }

    /// Metadata of the file or folder behind a shared link
    pub async fn shared_link_metadata(&self, shared_link: &str) -> Result<Value> {
        info!("Getting filename from shared link {}", shared_link);

        let spec = self
            .session
            .rpc("sharing/get_shared_link_metadata")?
            .json(&json!({ "url": shared_link }))?;
        self.session.executor().execute(&spec).await?.json().await
    }

    async fn download_to(&self, spec: &RequestSpec, local: &Path) -> Result<PathBuf> {
        let response = self.session.executor().execute(spec).await?;

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local).await?;
        let written = match write_body(response, &mut file).await {
            Ok(written) => written,
            Err(e) => {
                drop(file);
                if let Err(remove) = tokio::fs::remove_file(local).await {
                    warn!("Could not remove partial file {}: {}", local.display(), remove);
                }
                return Err(e);
            }
        };

        debug!("Wrote {} bytes to {}", written, local.display());
        Ok(local.to_path_buf())
    }
}

async fn write_body(response: Response, file: &mut tokio::fs::File) -> Result<u64> {
    let written = response.write_to(file).await?;
    file.flush().await?;
    Ok(written)
}

/// Last path segment of a remote path or URL
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Local file name a download lands in when none is given
pub fn default_local_path(remote: &str) -> PathBuf {
    PathBuf::from(basename(remote))
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map(|(head, _)| head).unwrap_or(url)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
