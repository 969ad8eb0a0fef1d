use std::io::Read;
use std::path::{Path, PathBuf};

use md5::Context;
use thiserror::Error;

/// Content checksums are always MD5, matching what the bulk endpoint can
/// verify server-side.
pub const CONTENT_CHECKSUM_TYPE: &str = "MD5";

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported checksum type: {0}")]
    UnsupportedType(String),
    #[error("checksum worker failed")]
    Worker,
}

/// `"TYPE:hex"`, or empty when either half is missing.
pub fn make_checksum_header(kind: &str, digest: &str) -> String {
    if kind.is_empty() || digest.is_empty() {
        return String::new();
    }
    format!("{kind}:{digest}")
}

pub fn parse_checksum_header(header: &str) -> Option<(String, String)> {
    let (kind, digest) = header.split_once(':')?;
    if kind.is_empty() || digest.is_empty() {
        return None;
    }
    Some((kind.to_string(), digest.to_string()))
}

/// Hashes the file on a blocking worker thread. An empty `kind` means "no
/// checksum wanted" and yields an empty digest.
pub async fn compute_file_checksum(path: &Path, kind: &str) -> Result<String, ChecksumError> {
    if kind.is_empty() {
        return Ok(String::new());
    }
    if kind != CONTENT_CHECKSUM_TYPE {
        return Err(ChecksumError::UnsupportedType(kind.to_string()));
    }
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || md5_of_file(&path))
        .await
        .map_err(|_| ChecksumError::Worker)?
}

fn md5_of_file(path: &Path) -> Result<String, ChecksumError> {
    let mut file = std::fs::File::open(path)?;
    let mut context = Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_roundtrip() {
        let header = make_checksum_header("MD5", "abc123");
        assert_eq!(header, "MD5:abc123");
        assert_eq!(
            parse_checksum_header(&header),
            Some(("MD5".to_string(), "abc123".to_string()))
        );
    }

    #[test]
    fn empty_parts_yield_empty_header() {
        assert_eq!(make_checksum_header("", "abc"), "");
        assert_eq!(make_checksum_header("MD5", ""), "");
        assert_eq!(parse_checksum_header("MD5:"), None);
        assert_eq!(parse_checksum_header("no-colon"), None);
    }

    #[tokio::test]
    async fn md5_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let digest = compute_file_checksum(&path, "MD5").await.unwrap();
        assert_eq!(digest, "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn empty_kind_skips_hashing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.txt");
        assert_eq!(compute_file_checksum(&path, "").await.unwrap(), "");
    }

    #[tokio::test]
    async fn unsupported_kind_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            compute_file_checksum(&path, "Adler32").await,
            Err(ChecksumError::UnsupportedType(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.txt");
        assert!(matches!(
            compute_file_checksum(&path, "MD5").await,
            Err(ChecksumError::Io(_))
        ));
    }
}
