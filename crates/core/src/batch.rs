//! Batched upload sessions
//!
//! Files are uploaded one by one into server-side upload sessions, each of
//! which yields a [`PendingCommit`]. The commits accumulate in a bounded
//! batch that is submitted in one `finish_batch` call; the server either
//! completes it immediately or hands back a job id to poll.
//!
//! Lifecycle of one batch:
//! `EMPTY -> ACCUMULATING -> SUBMITTED -> COMPLETE` or
//! `SUBMITTED -> ASYNC_PENDING -> COMPLETE`. The local batch is empty again
//! the moment it is submitted, whatever the server answers.

use crate::client::ApiSession;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Maximum number of commits the API accepts in one batch
pub const MAX_BATCH_ENTRIES: usize = 1000;

/// Default delay between job status checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const UPLOAD_SESSION_START: &str = "files/upload_session/start";
const FINISH_BATCH: &str = "files/upload_session/finish_batch";
const FINISH_BATCH_CHECK: &str = "files/upload_session/finish_batch/check";

/// Conflict handling when the destination already exists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Add,
    Overwrite,
    Update {
        #[serde(rename = "update")]
        rev: String,
    },
}

impl FromStr for WriteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "add" => Ok(WriteMode::Add),
            "overwrite" => Ok(WriteMode::Overwrite),
            other => match other.strip_prefix("update:") {
                Some(rev) if !rev.is_empty() => Ok(WriteMode::Update {
                    rev: rev.to_string(),
                }),
                _ => Err(Error::InvalidInput(format!(
                    "Unknown write mode '{}' (expected add, overwrite or update:<rev>)",
                    other
                ))),
            },
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Add => write!(f, "add"),
            WriteMode::Overwrite => write!(f, "overwrite"),
            WriteMode::Update { rev } => write!(f, "update:{}", rev),
        }
    }
}

/// Write flags applied to a committed file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOptions {
    pub mode: WriteMode,
    pub autorename: bool,
    pub mute: bool,
}

/// Position reached in an upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    pub session_id: String,
    pub offset: u64,
}

/// Destination and flags for one upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub path: String,
    pub mode: WriteMode,
    pub autorename: bool,
    pub mute: bool,
}

impl CommitInfo {
    pub fn new(path: impl Into<String>, options: &CommitOptions) -> Self {
        Self {
            path: path.into(),
            mode: options.mode.clone(),
            autorename: options.autorename,
            mute: options.mute,
        }
    }
}

/// One uploaded file waiting to be committed with the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommit {
    pub cursor: UploadCursor,
    pub commit: CommitInfo,
}

/// Per-file result of a finished batch, kept exactly as the server sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMetadata(Map<String, Value>);

impl FileMetadata {
    pub fn tag(&self) -> Option<&str> {
        self.str_field(".tag")
    }

    pub fn is_failure(&self) -> bool {
        self.tag() == Some("failure")
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn path_display(&self) -> Option<&str> {
        self.str_field("path_display")
    }

    pub fn size(&self) -> Option<u64> {
        self.0.get("size").and_then(Value::as_u64)
    }

    pub fn server_modified(&self) -> Option<&str> {
        self.str_field("server_modified")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for FileMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// How to wait for an asynchronous batch job
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::every(DEFAULT_POLL_INTERVAL)
    }
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            cancel: None,
        }
    }

    /// Give up polling after `deadline` with [`Error::Timeout`]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stop polling with [`Error::Cancelled`] once `token` fires
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Deserialize)]
struct UploadSessionStartReply {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
enum FinishBatchReply {
    Complete { entries: Vec<FileMetadata> },
    AsyncJobId { async_job_id: String },
}

impl FinishBatchReply {
    const TAGS: &'static [&'static str] = &["complete", "async_job_id"];
}

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
enum FinishBatchCheckReply {
    Complete { entries: Vec<FileMetadata> },
    InProgress,
    Failed {
        #[serde(default)]
        failed: Value,
    },
}

impl FinishBatchCheckReply {
    const TAGS: &'static [&'static str] = &["complete", "in_progress", "failed"];
}

/// Server-side batch commit still running
#[derive(Debug, Clone)]
struct AsyncJobHandle {
    job_id: String,
    poll_interval: Duration,
}

#[derive(Debug, Default)]
struct BatchState {
    entries: Vec<PendingCommit>,
    /// Uploads that passed the capacity check and are still in flight
    reserved: usize,
}

impl BatchState {
    fn occupied(&self) -> usize {
        self.entries.len() + self.reserved
    }
}

/// Accumulates pending commits and submits them as one batch.
pub struct UploadBatchManager {
    session: Arc<ApiSession>,
    state: Mutex<BatchState>,
    capacity: usize,
}

impl UploadBatchManager {
    pub fn new(session: Arc<ApiSession>) -> Self {
        Self::with_capacity(session, MAX_BATCH_ENTRIES)
    }

    /// Manager holding at most `capacity` commits, never more than the API limit
    pub fn with_capacity(session: Arc<ApiSession>, capacity: usize) -> Self {
        Self {
            session,
            state: Mutex::new(BatchState::default()),
            capacity: capacity.clamp(1, MAX_BATCH_ENTRIES),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of the commits queued so far
    pub fn pending(&self) -> Vec<PendingCommit> {
        self.lock().entries.clone()
    }

    /// Upload `local_path` into a new session and queue its commit.
    ///
    /// Fails without touching the network when the file is missing or the
    /// batch is full.
    pub async fn begin_upload(
        &self,
        local_path: impl AsRef<Path>,
        destination: &str,
        options: &CommitOptions,
    ) -> Result<PendingCommit> {
        let local_path = local_path.as_ref();
        if !tokio::fs::try_exists(local_path).await.unwrap_or(false) {
            return Err(Error::LocalFileNotFound(local_path.to_path_buf()));
        }

        let slot = self.reserve()?;

        info!("Uploading {}", display_name(local_path));
        debug!("to {}", destination);

        let content = tokio::fs::read(local_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::LocalFileNotFound(local_path.to_path_buf()),
            _ => Error::Io(e),
        })?;
        let offset = content.len() as u64;

        let spec = self
            .session
            .content(UPLOAD_SESSION_START)?
            .api_arg(&json!({ "close": true }))?
            .bytes(content)?;
        let reply: UploadSessionStartReply =
            self.session.executor().execute(&spec).await?.json().await?;

        let commit = PendingCommit {
            cursor: UploadCursor {
                session_id: reply.session_id,
                offset,
            },
            commit: CommitInfo::new(destination, options),
        };
        slot.fill(commit.clone());

        Ok(commit)
    }

    /// Submit every queued commit and wait for the server to apply them.
    pub async fn finish_batch(&self, options: &PollOptions) -> Result<Vec<FileMetadata>> {
        let entries = self.take_for_submission()?;

        info!("Finishing upload batch");
        debug!("Batch size is {}", entries.len());

        match self.submit(&entries).await? {
            FinishBatchReply::Complete { entries } => {
                info!("Upload batch finished");
                Ok(entries)
            }
            FinishBatchReply::AsyncJobId { async_job_id } => {
                let job = AsyncJobHandle {
                    job_id: async_job_id,
                    poll_interval: options.interval,
                };
                self.wait_for_job(job, options).await
            }
        }
    }

    async fn submit(&self, entries: &[PendingCommit]) -> Result<FinishBatchReply> {
        let spec = self
            .session
            .rpc(FINISH_BATCH)?
            .json(&json!({ "entries": entries }))?;
        let value: Value = self.session.executor().execute(&spec).await?.json().await?;
        decode_tagged(FINISH_BATCH, value, FinishBatchReply::TAGS)
    }

    async fn wait_for_job(
        &self,
        job: AsyncJobHandle,
        options: &PollOptions,
    ) -> Result<Vec<FileMetadata>> {
        debug!(
            "Batch not finished, checking every {:?}",
            job.poll_interval
        );

        let poll = async {
            match options.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, self.poll_job(&job)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                },
                None => self.poll_job(&job).await,
            }
        };

        match &options.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                result = poll => result,
            },
            None => poll.await,
        }
    }

    async fn poll_job(&self, job: &AsyncJobHandle) -> Result<Vec<FileMetadata>> {
        let spec = self
            .session
            .rpc(FINISH_BATCH_CHECK)?
            .json(&json!({ "async_job_id": job.job_id }))?;

        loop {
            let value: Value = self.session.executor().execute(&spec).await?.json().await?;
            match decode_tagged(FINISH_BATCH_CHECK, value, FinishBatchCheckReply::TAGS)? {
                FinishBatchCheckReply::Complete { entries } => {
                    info!("Upload batch finished");
                    return Ok(entries);
                }
                FinishBatchCheckReply::InProgress => {
                    debug!("Checking again in {:?}", job.poll_interval);
                    tokio::time::sleep(job.poll_interval).await;
                }
                FinishBatchCheckReply::Failed { failed } => {
                    return Err(Error::JobFailed(failed.to_string()));
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self) -> Result<SlotReservation<'_>> {
        let mut state = self.lock();
        if state.occupied() >= self.capacity {
            return Err(Error::BatchFull {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;
        Ok(SlotReservation {
            manager: self,
            filled: false,
        })
    }

    /// Drain the batch; nothing submitted is ever put back.
    fn take_for_submission(&self) -> Result<Vec<PendingCommit>> {
        let mut state = self.lock();
        if state.entries.is_empty() {
            return Err(Error::EmptyBatch);
        }
        Ok(std::mem::take(&mut state.entries))
    }
}

/// Capacity held by an upload in flight; returned on drop unless filled.
struct SlotReservation<'a> {
    manager: &'a UploadBatchManager,
    filled: bool,
}

impl SlotReservation<'_> {
    fn fill(mut self, commit: PendingCommit) {
        let mut state = self.manager.lock();
        state.reserved -= 1;
        state.entries.push(commit);
        self.filled = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.manager.lock().reserved -= 1;
        }
    }
}

/// Decode a `.tag` union, reporting tags outside `known` as unexpected.
fn decode_tagged<T: serde::de::DeserializeOwned>(
    endpoint: &str,
    value: Value,
    known: &[&str],
) -> Result<T> {
    if let Some(tag) = value.get(".tag").and_then(Value::as_str) {
        if !known.contains(&tag) {
            return Err(Error::UnexpectedTag {
                endpoint: endpoint.to_string(),
                tag: tag.to_string(),
            });
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
