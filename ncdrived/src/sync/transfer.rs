use std::env;
use std::path::Path;
use std::sync::Arc;

use ncdrive_core::BodyStream;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;

const DEVICE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload limiter is closed")]
    ConcurrencyClosed,
}

/// Gates how many bulk requests stream from disk at once. Shared by every
/// body of a batch; the propagator holds one permit per request in flight.
#[derive(Clone)]
pub struct BandwidthManager {
    upload_limit: Arc<Semaphore>,
}

impl BandwidthManager {
    pub fn new() -> Self {
        Self::with_limit(read_u64_env("NCDRIVE_UPLOAD_CONCURRENCY", 2) as usize)
    }

    pub fn with_limit(permits: usize) -> Self {
        Self {
            upload_limit: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    pub async fn acquire_upload(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        self.upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)
    }

    /// Opens a streaming read handle over `[0, size)` of the local file.
    pub async fn open_device(&self, path: &Path, size: i64) -> Result<UploadDevice, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        Ok(UploadDevice {
            file,
            size: size.max(0) as u64,
        })
    }
}

impl Default for BandwidthManager {
    fn default() -> Self {
        Self::new()
    }
}

/// An opened upload body. Moved into the bulk request at start time and kept
/// alive by the request until it ends.
#[derive(Debug)]
pub struct UploadDevice {
    file: tokio::fs::File,
    size: u64,
}

impl UploadDevice {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_body_stream(self) -> BodyStream {
        let reader = self.file.take(self.size);
        Box::pin(ReaderStream::with_capacity(reader, DEVICE_CHUNK_SIZE))
    }
}

pub(crate) fn read_u64_env(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn device_streams_exactly_the_requested_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let manager = BandwidthManager::with_limit(1);
        let device = manager.open_device(&path, 4).await.unwrap();
        assert_eq!(device.size(), 4);

        let mut stream = device.into_body_stream();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"0123");
    }

    #[tokio::test]
    async fn missing_file_fails_the_open() {
        let dir = tempdir().unwrap();
        let manager = BandwidthManager::with_limit(1);
        let err = manager
            .open_device(&dir.path().join("gone.bin"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[tokio::test]
    async fn permits_serialize_uploads() {
        let manager = BandwidthManager::with_limit(1);
        let first = manager.acquire_upload().await.unwrap();
        assert!(manager.upload_limit.available_permits() == 0);
        drop(first);
        assert!(manager.upload_limit.available_permits() == 1);
    }
}
