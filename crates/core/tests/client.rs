use dropline_core::{
    CommitOptions, DropboxClient, Endpoints, Error, PollOptions, ReqwestTransport, RequestSpec,
    RetryPolicy, TraceContext, Transport, WriteMode,
};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> DropboxClient {
    DropboxClient::builder("test-token")
        .endpoints(Endpoints::with_base_url(&server.uri()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn validate_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/check/user"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({ "query": "dropline" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "dropline" })))
        .expect(1)
        .mount(&server)
        .await;

    assert_ok!(client(&server).validate().await);
}

#[tokio::test]
async fn validate_rejects_wrong_echo() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/check/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "other" })))
        .mount(&server)
        .await;

    let err = assert_err!(client(&server).validate().await);
    assert!(matches!(err, Error::InvalidToken));
}

#[tokio::test]
async fn download_file_streams_to_disk() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .and(header("dropbox-api-arg", r#"{"path":"/Docs/report.txt"}"#))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"quarterly numbers".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested").join("report.txt");
    let written = client(&server)
        .download_file("/Docs/report.txt", Some(&target))
        .await
        .unwrap();

    assert_eq!(written, target);
    assert_eq!(std::fs::read(&target).unwrap(), b"quarterly numbers");
}

#[tokio::test]
async fn api_error_exposes_tag_and_summary() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/not_found/..",
            "error": { ".tag": "path", "path": { ".tag": "not_found" } }
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = client(&server)
        .download_file("/missing.txt", Some(&dir.path().join("missing.txt")))
        .await
        .unwrap_err();

    let api = err.as_api().expect("api error");
    assert_eq!(api.status.as_u16(), 409);
    assert_eq!(api.tag().as_deref(), Some("path"));
    assert_eq!(api.summary().as_deref(), Some("path/not_found/.."));
    assert!(!dir.path().join("missing.txt").exists());
}

#[tokio::test]
async fn rate_limited_request_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/check/user"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/check/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": "dropline" })))
        .expect(1)
        .mount(&server)
        .await;

    assert_ok!(client(&server).validate().await);
}

#[tokio::test]
async fn exhausted_retries_fail_when_configured() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/check/user"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "0"))
        .expect(2)
        .mount(&server)
        .await;

    let policy = RetryPolicy {
        max_attempts: 2,
        retry_statuses: vec![reqwest::StatusCode::SERVICE_UNAVAILABLE],
        on_exhausted: dropline_core::ExhaustedRetryPolicy::Fail,
    };
    let client = DropboxClient::builder("test-token")
        .endpoints(Endpoints::with_base_url(&server.uri()))
        .retry_policy(policy)
        .build()
        .unwrap();

    let err = assert_err!(client.validate().await);
    assert_eq!(err.as_api().map(|api| api.status.as_u16()), Some(503));
}

#[tokio::test]
async fn shared_link_reuses_existing_link() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/sharing/create_shared_link_with_settings"))
        .and(body_json(json!({ "path": "/Docs/a.txt" })))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "shared_link_already_exists/metadata/..",
            "error": {
                ".tag": "shared_link_already_exists",
                "shared_link_already_exists": {
                    ".tag": "metadata",
                    "metadata": { "url": "https://www.dropbox.com/s/xyz/a.txt?dl=0" }
                }
            }
        })))
        .mount(&server)
        .await;

    let url = client(&server).create_shared_link("/Docs/a.txt").await.unwrap();
    assert_eq!(url, "https://www.dropbox.com/s/xyz/a.txt?dl=0");
}

#[tokio::test]
async fn shared_link_for_missing_path_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/sharing/create_shared_link_with_settings"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_summary": "path/not_found/",
            "error": { ".tag": "path", "path": { ".tag": "not_found" } }
        })))
        .mount(&server)
        .await;

    let err = client(&server).create_shared_link("/nope.txt").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn batch_upload_round_trip() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/upload_session/start"))
        .and(header("content-type", "application/octet-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "session_id": "sess-1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload_session/finish_batch"))
        .and(body_json(json!({
            "entries": [{
                "cursor": { "session_id": "sess-1", "offset": 5 },
                "commit": {
                    "path": "/up/hello.txt",
                    "mode": { ".tag": "overwrite" },
                    "autorename": false,
                    "mute": true
                }
            }]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ ".tag": "async_job_id", "async_job_id": "job-1" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload_session/finish_batch/check"))
        .and(body_json(json!({ "async_job_id": "job-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            ".tag": "complete",
            "entries": [{
                ".tag": "success",
                "name": "hello.txt",
                "path_display": "/up/hello.txt",
                "size": 5
            }]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hello.txt");
    std::fs::write(&file, b"hello").unwrap();

    let client = client(&server);
    let options = CommitOptions {
        mode: WriteMode::Overwrite,
        autorename: false,
        mute: true,
    };
    client.begin_upload(&file, "/up/hello.txt", &options).await.unwrap();
    assert_eq!(client.batch().len(), 1);

    let entries = client
        .finish_batch(&PollOptions::every(Duration::from_millis(10)))
        .await
        .unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path_display(), Some("/up/hello.txt"));
    assert_eq!(entries[0].size(), Some(5));
    assert!(client.batch().is_empty());
}

#[tokio::test]
async fn truncated_download_leaves_no_file() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nonly part")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
    });

    let client = DropboxClient::builder("test-token")
        .endpoints(Endpoints::with_base_url(&format!("http://{}", addr)))
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("report.txt");

    assert_err!(client.download_file("/Docs/report.txt", Some(&target)).await);
    assert!(!target.exists());
}

#[tokio::test]
async fn per_host_cap_holds_sends_until_a_response_drops() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(2, None).unwrap();
    let spec = RequestSpec::post(format!("{}/slow", server.uri()));
    let trace = TraceContext::new();

    let first = transport.send(&spec, &trace).await.unwrap();
    let second = transport.send(&spec, &trace).await.unwrap();

    let blocked = tokio::time::timeout(Duration::from_millis(200), transport.send(&spec, &trace)).await;
    assert!(blocked.is_err());

    drop(first);
    let third = tokio::time::timeout(Duration::from_secs(5), transport.send(&spec, &trace))
        .await
        .expect("send should proceed once a slot is free")
        .unwrap();
    assert_eq!(third.status(), 200);
    assert_eq!(second.status(), 200);
}
