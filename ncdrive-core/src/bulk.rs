use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use tracing::debug;

use crate::account::{Account, DavError};

pub const BULK_ENDPOINT: &str = "remote.php/dav/bulk";

/// Streaming body of one file in a bulk request. The read handle is owned by
/// the stream and lives until the request completes.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync + 'static>>;

/// One file of a bulk request: its per-part header block (in emission order)
/// and the body stream that is moved into the request.
pub struct OneUploadFileData {
    pub headers: Vec<(String, String)>,
    pub body: BodyStream,
}

/// One element of the server's JSON-array reply, keyed by header name.
#[derive(Debug, Clone, Default)]
pub struct FileReply(Map<String, Value>);

impl FileReply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
pub struct BulkReply {
    pub status: StatusCode,
    replies: Vec<FileReply>,
}

impl BulkReply {
    pub fn replies(&self) -> &[FileReply] {
        &self.replies
    }

    /// First reply whose `X-File-Path` matches the uploaded path. A missing
    /// correlation yields an empty reply object.
    pub fn reply_for(&self, remote_path: &str) -> FileReply {
        self.replies
            .iter()
            .find(|reply| reply.header("X-File-Path") == Some(remote_path))
            .cloned()
            .unwrap_or_default()
    }
}

impl Account {
    /// Sends every pending file body in a single request against the bulk
    /// endpoint. Each part carries its own header block; the reply is a JSON
    /// array with one object per file.
    pub async fn put_multi_file(
        &self,
        request_id: &str,
        files: Vec<OneUploadFileData>,
    ) -> Result<BulkReply, DavError> {
        let url = self.endpoint(BULK_ENDPOINT)?;
        let boundary = format!(
            "ncdrive-{:016x}{:016x}",
            rand::random::<u64>(),
            rand::random::<u64>()
        );
        debug!(files = files.len(), %url, "bulk upload request");

        let body = reqwest::Body::wrap_stream(multipart_stream(&boundary, files));
        let response = self
            .http()
            .post(url)
            .basic_auth(self.user(), Some(self.password()))
            .header(
                "Content-Type",
                format!("multipart/related; boundary={boundary}"),
            )
            .header("X-Request-ID", request_id)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DavError::Api { status, body });
        }

        let payload = response.bytes().await?;
        let replies = parse_bulk_reply(&payload)?;
        Ok(BulkReply { status, replies })
    }
}

fn multipart_stream(boundary: &str, files: Vec<OneUploadFileData>) -> BodyStream {
    let mut parts: Vec<BodyStream> = Vec::with_capacity(files.len() + 1);
    for file in files {
        let mut head = format!("--{boundary}\r\n");
        for (name, value) in &file.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        let head = stream::once(std::future::ready(Ok(Bytes::from(head))));
        let tail = stream::once(std::future::ready(Ok(Bytes::from_static(b"\r\n"))));
        parts.push(Box::pin(head.chain(file.body).chain(tail)));
    }
    let closing = Bytes::from(format!("--{boundary}--\r\n"));
    parts.push(Box::pin(stream::once(std::future::ready(Ok(closing)))));
    Box::pin(stream::iter(parts).flatten())
}

fn parse_bulk_reply(payload: &[u8]) -> Result<Vec<FileReply>, DavError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<Map<String, Value>> = serde_json::from_slice(payload)?;
    Ok(entries.into_iter().map(FileReply).collect())
}

/// Normalizes a server etag: drops a weak-validator prefix, the surrounding
/// double quotes the server always adds, and a `-gzip` suffix injected by
/// compressing proxies.
pub fn parse_etag(raw: &str) -> String {
    let mut etag = raw.trim();
    if let Some(rest) = etag.strip_prefix("W/") {
        etag = rest;
    }
    let etag = etag.trim_matches('"');
    etag.strip_suffix("-gzip").unwrap_or(etag).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_etag_strips_quotes() {
        assert_eq!(parse_etag("\"abc123\""), "abc123");
    }

    #[test]
    fn parse_etag_strips_weak_prefix_and_gzip_suffix() {
        assert_eq!(parse_etag("W/\"abc-gzip\""), "abc");
        assert_eq!(parse_etag("abc-gzip"), "abc");
    }

    #[test]
    fn parse_etag_keeps_plain_values() {
        assert_eq!(parse_etag("5d41402abc"), "5d41402abc");
        assert_eq!(parse_etag(""), "");
    }

    #[test]
    fn reply_correlation_is_by_file_path() {
        let payload = br#"[
            {"X-File-Path": "/a.txt", "OC-ETag": "\"one\""},
            {"X-File-Path": "/b.txt", "OC-ETag": "\"two\""}
        ]"#;
        let reply = BulkReply {
            status: StatusCode::OK,
            replies: parse_bulk_reply(payload).unwrap(),
        };
        assert_eq!(
            reply.reply_for("/b.txt").header("OC-ETag"),
            Some("\"two\"")
        );
        assert!(reply.reply_for("/missing.txt").is_empty());
    }

    #[test]
    fn empty_payload_parses_to_no_replies() {
        assert!(parse_bulk_reply(b"").unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(parse_bulk_reply(b"{\"not\": \"an array\"}").is_err());
    }
}
