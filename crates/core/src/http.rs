//! HTTP transport and response handling
//!
//! The executor talks to the network only through [`Transport`]. The
//! production implementation wraps a pooled `reqwest::Client` and caps the
//! number of in-flight connections per destination host.

use crate::error::{Error, ErrorBody, Result};
use crate::request::{RequestSpec, TraceContext};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, debug_span, trace, Instrument};

/// Default cap on concurrent connections to a single host
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 50;

/// Sends one attempt of a request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestSpec, trace: &TraceContext) -> Result<Response>;
}

/// Response of a single attempt.
///
/// Holds the connection slot it was sent under; the slot and the underlying
/// connection go back to the pool when the response is dropped.
#[derive(Debug)]
pub struct Response {
    inner: reqwest::Response,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Response {
    pub fn new(inner: reqwest::Response) -> Self {
        Self {
            inner,
            _permit: None,
        }
    }

    fn with_permit(inner: reqwest::Response, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner,
            _permit: Some(permit),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Server backoff hint in whole seconds
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers()
            .get(RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }

    pub fn is_json(&self) -> bool {
        self.headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_start().starts_with("application/json"))
            .unwrap_or(false)
    }

    /// Read the body, decoding it as JSON when the content type says so.
    pub async fn body(self) -> Result<ResponseBody> {
        let is_json = self.is_json();
        let text = self.inner.text().await?;
        if is_json {
            if let Ok(value) = serde_json::from_str(&text) {
                return Ok(ResponseBody::Json(value));
            }
        }
        Ok(ResponseBody::Text(text))
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.inner.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn text(self) -> Result<String> {
        Ok(self.inner.text().await?)
    }

    /// Stream the body into `writer` chunk by chunk, returning the byte count.
    pub async fn write_to<W>(mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.inner.chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}

impl<T: Into<reqwest::Body>> From<http::Response<T>> for Response {
    fn from(response: http::Response<T>) -> Self {
        Self::new(reqwest::Response::from(response))
    }
}

/// Decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl From<ResponseBody> for ErrorBody {
    fn from(body: ResponseBody) -> Self {
        match body {
            ResponseBody::Json(value) => ErrorBody::Json(value),
            ResponseBody::Text(text) => ErrorBody::Text(text),
        }
    }
}

/// `reqwest`-backed transport with a per-host connection limit
pub struct ReqwestTransport {
    client: Client,
    max_per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ReqwestTransport {
    /// Create a transport allowing `max_per_host` concurrent connections per host
    pub fn new(max_per_host: usize, timeout: Option<Duration>) -> Result<Self> {
        if max_per_host == 0 {
            return Err(Error::InvalidInput(
                "max_connections_per_host must be at least 1".to_string(),
            ));
        }

        let mut builder = Client::builder().pool_max_idle_per_host(max_per_host);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            max_per_host,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    fn host_slot(&self, url: &Url) -> Arc<Semaphore> {
        let key = format!(
            "{}://{}:{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        );
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        hosts
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestSpec, trace: &TraceContext) -> Result<Response> {
        let url = Url::parse(&request.url)
            .map_err(|e| Error::InvalidInput(format!("Invalid URL {}: {}", request.url, e)))?;

        let permit = self
            .host_slot(&url)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;

        let span = debug_span!(
            "send",
            endpoint = endpoint_name(&request.url),
            attempt = trace.get("current_attempt").unwrap_or_default()
        );

        async move {
            trace!(url = %url, trace = ?trace, "sending request");

            let mut builder = self
                .client
                .request(request.method.clone(), url)
                .headers(request.headers.clone());
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await?;
            debug!(status = response.status().as_u16(), "response received");

            Ok::<_, Error>(Response::with_permit(response, permit))
        }
        .instrument(span)
        .await
    }
}

/// Short endpoint name for log lines: the route after the API version segment.
pub fn endpoint_name(url: &str) -> &str {
    match url.find("/2/") {
        Some(index) => &url[index + 3..],
        None => url,
    }
}
