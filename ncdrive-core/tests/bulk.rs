use bytes::Bytes;
use futures_util::stream;
use ncdrive_core::{Account, DavError, OneUploadFileData, PollStatus};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn part(headers: &[(&str, &str)], body: &'static [u8]) -> OneUploadFileData {
    OneUploadFileData {
        headers: headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        body: Box::pin(stream::once(std::future::ready(Ok(Bytes::from_static(
            body,
        ))))),
    }
}

#[tokio::test]
async fn put_multi_file_posts_all_parts_to_the_bulk_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .and(header("x-request-id", "req-1"))
        .and(header_exists("authorization"))
        .and(body_string_contains("X-File-Path: /a.txt"))
        .and(body_string_contains("X-File-Path: /b.txt"))
        .and(body_string_contains("hello"))
        .and(body_string_contains("world"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"X-File-Path": "/a.txt", "OC-ETag": "\"etag-a\""},
            {"X-File-Path": "/b.txt", "OC-ETag": "\"etag-b\""}
        ])))
        .mount(&server)
        .await;

    let account = Account::with_base_url(&server.uri(), "demo", "secret").unwrap();
    let reply = account
        .put_multi_file(
            "req-1",
            vec![
                part(
                    &[
                        ("Content-Type", "application/octet-stream"),
                        ("X-File-Path", "/a.txt"),
                        ("Content-Length", "5"),
                    ],
                    b"hello",
                ),
                part(
                    &[
                        ("Content-Type", "application/octet-stream"),
                        ("X-File-Path", "/b.txt"),
                        ("Content-Length", "5"),
                    ],
                    b"world",
                ),
            ],
        )
        .await
        .unwrap();

    assert_eq!(reply.status, 200);
    assert_eq!(
        reply.reply_for("/a.txt").header("OC-ETag"),
        Some("\"etag-a\"")
    );
    assert_eq!(
        reply.reply_for("/b.txt").header("OC-ETag"),
        Some("\"etag-b\"")
    );
}

#[tokio::test]
async fn put_multi_file_surfaces_outer_http_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(507).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let account = Account::with_base_url(&server.uri(), "demo", "secret").unwrap();
    let err = account
        .put_multi_file("req-2", vec![part(&[("X-File-Path", "/big.bin")], b"x")])
        .await
        .unwrap_err();

    match err {
        DavError::Api { status, body } => {
            assert_eq!(status.as_u16(), 507);
            assert_eq!(body, "quota exceeded");
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test]
async fn deferred_replies_carry_the_poll_location() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!([
            {"X-File-Path": "/slow.bin", "OC-JobStatus-Location": "/poll/123"}
        ])))
        .mount(&server)
        .await;

    let account = Account::with_base_url(&server.uri(), "demo", "secret").unwrap();
    let reply = account
        .put_multi_file("req-3", vec![part(&[("X-File-Path", "/slow.bin")], b"x")])
        .await
        .unwrap();

    assert_eq!(reply.status, 202);
    assert_eq!(
        reply.reply_for("/slow.bin").header("OC-JobStatus-Location"),
        Some("/poll/123")
    );
}

#[tokio::test]
async fn poll_job_status_resolves_relative_urls() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/poll/123"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "finished"})))
        .mount(&server)
        .await;

    let account = Account::with_base_url(&server.uri(), "demo", "secret").unwrap();
    let reply = account.poll_job_status("/poll/123").await.unwrap();
    assert_eq!(reply.status, PollStatus::Finished);
}

#[tokio::test]
async fn poll_job_status_accepts_absolute_urls() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/poll/abs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "started"})))
        .mount(&server)
        .await;

    let account = Account::with_base_url(&server.uri(), "demo", "secret").unwrap();
    let reply = account
        .poll_job_status(&format!("{}/poll/abs", server.uri()))
        .await
        .unwrap();
    assert_eq!(reply.status, PollStatus::Started);
}
