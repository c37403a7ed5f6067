//! dropline-core - Core library for the dropline CLI
//!
//! This library provides a resilient Dropbox API client: a retrying request
//! executor, a bounded batch upload manager with async job polling, file and
//! shared link downloads, and configuration management.

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod request;

// Re-export commonly used types
pub use batch::{
    CommitInfo, CommitOptions, FileMetadata, PendingCommit, PollOptions, UploadBatchManager,
    UploadCursor, WriteMode, DEFAULT_POLL_INTERVAL, MAX_BATCH_ENTRIES,
};
pub use client::{ApiSession, DropboxClient, DropboxClientBuilder, Endpoints};
pub use config::{
    config_exists, get_config_path, load_config, load_config_from, resolve_token, save_config,
    validate_config,
};
pub use config::ConfigFile;
pub use error::{ApiError, Error, ErrorBody, Result};
pub use http::{ReqwestTransport, Response, ResponseBody, Transport};
pub use request::{
    AttemptState, ExhaustedRetryPolicy, RequestExecutor, RequestSpec, RetryPolicy, TraceContext,
};
