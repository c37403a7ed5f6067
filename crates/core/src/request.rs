//! Request execution with retry and backoff

use crate::error::{ApiError, Result};
use crate::http::{endpoint_name, Response, Transport};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the JSON argument of content-body endpoints, lowercased
/// so it can be used as a static `HeaderName`
pub const API_ARG_HEADER: &str = "dropbox-api-arg";

/// Attempts per request unless configured otherwise
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff used when the server sends no `Retry-After` hint
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Opaque key/value context handed to the transport with every attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext(BTreeMap<String, String>);

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// What to do when retries run out while the status is still retryable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedRetryPolicy {
    /// Hand the last response back to the caller as-is
    #[default]
    #[serde(rename = "return")]
    ReturnLast,
    /// Treat the last response as a terminal API error
    Fail,
}

/// Executor-wide defaults applied to every request it builds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_statuses: Vec<StatusCode>,
    pub on_exhausted: ExhaustedRetryPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_statuses: vec![StatusCode::TOO_MANY_REQUESTS],
            on_exhausted: ExhaustedRetryPolicy::default(),
        }
    }
}

/// One logical HTTP call.
///
/// Built once and never mutated while it is being executed.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub ok_statuses: Vec<StatusCode>,
    pub retry_statuses: Vec<StatusCode>,
    pub max_attempts: u32,
    pub backoff: Option<Duration>,
    pub trace: TraceContext,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            ok_statuses: vec![StatusCode::OK],
            retry_statuses: vec![StatusCode::TOO_MANY_REQUESTS],
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: None,
            trace: TraceContext::new(),
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            crate::Error::InvalidInput(format!("Invalid value for header {}: {}", name, e))
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn bearer(self, token: &str) -> Result<Self> {
        self.header(AUTHORIZATION, &format!("Bearer {}", token))
    }

    /// Pass `arg` in the `Dropbox-API-Arg` header
    pub fn api_arg<T: Serialize + ?Sized>(self, arg: &T) -> Result<Self> {
        let encoded = header_safe_json(arg)?;
        self.header(HeaderName::from_static(API_ARG_HEADER), &encoded)
    }

    /// JSON request body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        self.header(CONTENT_TYPE, "application/json")
    }

    /// Raw upload body
    pub fn bytes(mut self, body: Vec<u8>) -> Result<Self> {
        self.body = Some(body);
        self.header(CONTENT_TYPE, "application/octet-stream")
    }

    pub fn ok_statuses(mut self, statuses: &[StatusCode]) -> Self {
        self.ok_statuses = statuses.to_vec();
        self
    }

    pub fn retry_statuses(mut self, statuses: &[StatusCode]) -> Self {
        self.retry_statuses = statuses.to_vec();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }
}

/// JSON for an HTTP header value: everything outside printable ASCII is
/// escaped as `\uXXXX`.
pub fn header_safe_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() && c != '\u{7f}' {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

/// Attempts made so far for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    current: u32,
    max: u32,
}

impl AttemptState {
    pub fn new(max: u32) -> Self {
        Self {
            current: 0,
            max: max.max(1),
        }
    }

    /// Count a new attempt and return its 1-based number
    pub fn begin(&mut self) -> u32 {
        self.current += 1;
        self.current
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.current)
    }
}

/// Runs requests over a [`Transport`], retrying retryable statuses.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_policy(transport, RetryPolicy::default())
    }

    pub fn with_policy(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// POST request carrying this executor's retry defaults
    pub fn post(&self, url: impl Into<String>) -> RequestSpec {
        RequestSpec::post(url)
            .retry_statuses(&self.policy.retry_statuses)
            .max_attempts(self.policy.max_attempts)
    }

    /// Execute `spec`, retrying until it succeeds, fails terminally or runs
    /// out of attempts.
    ///
    /// Statuses in the ok set return the response. Retryable statuses sleep
    /// for `Retry-After` seconds (or the fixed backoff, or one second) and try
    /// again while attempts remain. Anything else becomes an [`ApiError`].
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Response> {
        let endpoint = endpoint_name(&spec.url);
        let mut attempts = AttemptState::new(spec.max_attempts);

        loop {
            let attempt = attempts.begin();
            if attempt > 1 {
                debug!("Attempt {} out of {}", attempt, attempts.max());
            }

            let trace = spec
                .trace
                .clone()
                .with("current_attempt", attempt.to_string());
            let response = self.transport.send(spec, &trace).await?;
            let status = response.status();

            debug!(
                endpoint,
                attempt,
                status = status.as_u16(),
                "Request to {} returned {}",
                endpoint,
                status.as_u16()
            );

            if spec.ok_statuses.contains(&status) {
                return Ok(response);
            }

            if spec.retry_statuses.contains(&status) {
                if attempts.remaining() > 0 {
                    let delay = response
                        .retry_after()
                        .or(spec.backoff)
                        .unwrap_or(DEFAULT_BACKOFF);
                    warn!(
                        "{} returned {}, retrying in {:?} (attempt {}/{})",
                        endpoint,
                        status.as_u16(),
                        delay,
                        attempt,
                        attempts.max()
                    );
                    drop(response);
                    tokio::time::sleep(delay).await;
                    continue;
                }

                if self.policy.on_exhausted == ExhaustedRetryPolicy::ReturnLast {
                    warn!(
                        "{} still returned {} after {} attempts, returning last response",
                        endpoint,
                        status.as_u16(),
                        attempt
                    );
                    return Ok(response);
                }
            }

            let body = response.body().await?;
            return Err(ApiError::new(status, body.into()).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorBody};
    use crate::http::testing::ScriptedTransport;
    use serde_json::json;
    use tokio::time::Instant;

    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(10),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    fn executor(transport: &Arc<ScriptedTransport>) -> RequestExecutor {
        RequestExecutor::new(transport.clone())
    }

    fn fail_on_exhausted(transport: &Arc<ScriptedTransport>) -> RequestExecutor {
        RequestExecutor::with_policy(
            transport.clone(),
            RetryPolicy {
                on_exhausted: ExhaustedRetryPolicy::Fail,
                ..RetryPolicy::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honoured() {
        let transport = ScriptedTransport::new();
        transport.push(429, &[("retry-after", "2")], "");
        transport.push(429, &[("retry-after", "2")], "");
        transport.push_json(200, json!({"ok": true}));

        let exec = executor(&transport);
        let started = Instant::now();
        let response = exec
            .execute(&exec.post("https://api.dropboxapi.com/2/check/user"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_close(started.elapsed(), Duration::from_secs(4));

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_close(calls[1].at - calls[0].at, Duration::from_secs(2));
        assert_close(calls[2].at - calls[1].at, Duration::from_secs(2));
        assert_eq!(calls[2].trace.get("current_attempt"), Some("3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_backoff_is_one_second() {
        let transport = ScriptedTransport::new();
        transport.push(429, &[], "");
        transport.push_json(200, json!({}));

        let exec = executor(&transport);
        let started = Instant::now();
        exec.execute(&exec.post("http://dbx.test/2/x")).await.unwrap();

        assert_close(started.elapsed(), DEFAULT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_backoff_used_without_hint() {
        let transport = ScriptedTransport::new();
        transport.push(429, &[], "");
        transport.push_json(200, json!({}));

        let exec = executor(&transport);
        let started = Instant::now();
        let spec = exec
            .post("http://dbx.test/2/x")
            .backoff(Duration::from_millis(250));
        exec.execute(&spec).await.unwrap();

        assert_close(started.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_terminal_status_is_api_error() {
        let transport = ScriptedTransport::new();
        transport.push_json(
            409,
            json!({"error_summary": "path/not_found/..", "error": {".tag": "path"}}),
        );

        let exec = executor(&transport);
        let err = exec
            .execute(&exec.post("http://dbx.test/2/files/download"))
            .await
            .unwrap_err();

        match err {
            Error::Api(api) => {
                assert_eq!(api.status, StatusCode::CONFLICT);
                assert_eq!(api.tag().as_deref(), Some("path"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_text_error_body_kept_raw() {
        let transport = ScriptedTransport::new();
        transport.push(400, &[("content-type", "text/plain")], "Error in call");

        let exec = executor(&transport);
        let err = exec.execute(&exec.post("http://dbx.test/2/x")).await.unwrap_err();
        let api = err.as_api().unwrap();
        assert_eq!(api.body, ErrorBody::Text("Error in call".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_last_response() {
        let transport = ScriptedTransport::new();
        for _ in 0..3 {
            transport.push(429, &[("retry-after", "1")], "");
        }

        let exec = executor(&transport);
        let spec = exec.post("http://dbx.test/2/x").max_attempts(3);
        let response = exec.execute(&spec).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_when_configured() {
        let transport = ScriptedTransport::new();
        for _ in 0..2 {
            transport.push_json(429, json!({"error": {".tag": "too_many_requests"}}));
        }

        let exec = fail_on_exhausted(&transport);
        let spec = exec.post("http://dbx.test/2/x").max_attempts(2);
        let err = exec.execute(&spec).await.unwrap_err();

        let api = err.as_api().unwrap();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.tag().as_deref(), Some("too_many_requests"));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_ok_set_takes_precedence_over_retry_set() {
        let transport = ScriptedTransport::new();
        transport.push_json(409, json!({"error_summary": "shared_link_already_exists/"}));

        let exec = executor(&transport);
        let spec = exec
            .post("http://dbx.test/2/x")
            .ok_statuses(&[StatusCode::OK, StatusCode::CONFLICT])
            .retry_statuses(&[StatusCode::CONFLICT]);
        let response = exec.execute(&spec).await.unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_retried() {
        let transport = ScriptedTransport::new();
        let exec = executor(&transport);
        let err = exec.execute(&exec.post("http://dbx.test/2/x")).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_trace_context_passed_through() {
        let transport = ScriptedTransport::new();
        transport.push_json(200, json!({}));

        let exec = executor(&transport);
        let spec = exec
            .post("http://dbx.test/2/x")
            .trace(TraceContext::new().with("file", "a.txt"));
        exec.execute(&spec).await.unwrap();

        let trace = &transport.calls()[0].trace;
        assert_eq!(trace.get("file"), Some("a.txt"));
        assert_eq!(trace.get("current_attempt"), Some("1"));
    }

    #[test]
    fn test_attempt_state_bounds() {
        let mut state = AttemptState::new(2);
        assert_eq!(state.remaining(), 2);
        assert_eq!(state.begin(), 1);
        assert_eq!(state.remaining(), 1);
        assert_eq!(state.begin(), 2);
        assert_eq!(state.remaining(), 0);

        assert_eq!(AttemptState::new(0).max(), 1);
    }

    #[test]
    fn test_header_safe_json_escapes_non_ascii() {
        let encoded = header_safe_json(&json!({"path": "/Фото/é😀.txt"})).unwrap();
        assert!(encoded.is_ascii());
        assert!(encoded.contains("\\u0424"));
        assert!(encoded.contains("\\ud83d\\ude00"));
        let decoded: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["path"], "/Фото/é😀.txt");
    }

    #[test]
    fn test_request_spec_headers() {
        let spec = RequestSpec::post("http://dbx.test/2/files/upload")
            .bearer("tok")
            .unwrap()
            .api_arg(&json!({"close": true}))
            .unwrap()
            .bytes(b"abc".to_vec())
            .unwrap();

        assert_eq!(spec.headers[AUTHORIZATION], "Bearer tok");
        assert_eq!(spec.headers[API_ARG_HEADER], r#"{"close":true}"#);
        assert!(spec.headers.contains_key("Dropbox-API-Arg"));
        assert_eq!(spec.headers.len(), 3);
        assert_eq!(spec.headers[CONTENT_TYPE], "application/octet-stream");
        assert_eq!(spec.body.as_deref(), Some(&b"abc"[..]));
    }
}
