use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ncdrive_core::{Account, DavError, FileReply, OneUploadFileData, PollStatus, parse_etag};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sync::blacklist;
use crate::sync::checksums::{self, ChecksumError};
use crate::sync::filesystem::{self, now_unix, octets_to_string, parent_dir};
use crate::sync::item::{Instruction, ItemStatus, SyncFileItem, UploadFileInfo};
use crate::sync::journal::{FileRecord, JournalError, PollInfo, SyncJournal, UploadInfo};
use crate::sync::transfer::{BandwidthManager, UploadDevice, read_u64_env};
use crate::sync::vfs::{ConvertToPlaceholderResult, PinState, Vfs, VfsOff};

/// How many queued items one batch may carry.
pub const BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum PropagatorError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
}

/// Observable boundary of the propagator.
#[derive(Debug, Clone)]
pub enum PropagatorEvent {
    ItemCompleted(SyncFileItem),
    InsufficientRemoteStorage,
    SeenLockedFile(PathBuf),
    Finished(ItemStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobParallelism {
    FullParallelism,
    /// While this job is active, the parent scheduler must not start sibling
    /// propagator jobs.
    WaitForFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    Asynchronous,
    Synchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Finished(ItemStatus),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Files modified more recently than this are skipped: they are likely
    /// still being written to.
    pub minimum_file_age_for_upload: Duration,
    pub poll_max_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            minimum_file_age_for_upload: Duration::from_millis(read_u64_env(
                "NCDRIVE_MIN_FILE_AGE_MS",
                2000,
            )),
            poll_max_attempts: read_u64_env("NCDRIVE_POLL_MAX_ATTEMPTS", 30) as u32,
        }
    }
}

/// Shared context of one sync run: account, journal, VFS, quota cache, the
/// abort flag and the event channel. All mutation happens on the controller
/// task of the active job.
pub struct Propagator {
    account: Account,
    journal: SyncJournal,
    vfs: Arc<dyn Vfs>,
    bandwidth: BandwidthManager,
    local_root: PathBuf,
    remote_root: String,
    folder_quota: Mutex<HashMap<String, i64>>,
    abort_requested: CancellationToken,
    another_sync_needed: AtomicBool,
    events: mpsc::UnboundedSender<PropagatorEvent>,
    options: SyncOptions,
}

impl Propagator {
    pub fn new(
        account: Account,
        journal: SyncJournal,
        local_root: PathBuf,
        events: mpsc::UnboundedSender<PropagatorEvent>,
    ) -> Self {
        Self {
            account,
            journal,
            vfs: Arc::new(VfsOff),
            bandwidth: BandwidthManager::new(),
            local_root,
            remote_root: "/".to_string(),
            folder_quota: Mutex::new(HashMap::new()),
            abort_requested: CancellationToken::new(),
            another_sync_needed: AtomicBool::new(false),
            events,
            options: SyncOptions::default(),
        }
    }

    pub fn with_vfs(mut self, vfs: Arc<dyn Vfs>) -> Self {
        self.vfs = vfs;
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: BandwidthManager) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn journal(&self) -> &SyncJournal {
        &self.journal
    }

    pub fn full_local_path(&self, rel_file: &str) -> PathBuf {
        self.local_root.join(rel_file)
    }

    pub fn full_remote_path(&self, rel_file: &str) -> String {
        format!("{}{}", self.remote_root, rel_file)
    }

    pub fn abort(&self, _kind: AbortKind) {
        self.abort_requested.cancel();
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.is_cancelled()
    }

    pub fn set_another_sync_needed(&self) {
        self.another_sync_needed.store(true, Ordering::Relaxed);
    }

    pub fn another_sync_needed(&self) -> bool {
        self.another_sync_needed.load(Ordering::Relaxed)
    }

    pub fn folder_quota(&self, folder: &str) -> Option<i64> {
        self.folder_quota
            .lock()
            .expect("quota mutex poisoned")
            .get(folder)
            .copied()
    }

    pub fn set_folder_quota(&self, folder: impl Into<String>, quota: i64) {
        self.folder_quota
            .lock()
            .expect("quota mutex poisoned")
            .insert(folder.into(), quota);
    }

    fn decrement_folder_quota(&self, folder: &str, by: i64) {
        if let Some(quota) = self
            .folder_quota
            .lock()
            .expect("quota mutex poisoned")
            .get_mut(folder)
        {
            *quota -= by;
        }
    }

    fn shrink_folder_quota(&self, folder: &str, cap: i64) {
        self.folder_quota
            .lock()
            .expect("quota mutex poisoned")
            .entry(folder.to_string())
            .and_modify(|quota| *quota = (*quota).min(cap))
            .or_insert(cap);
    }

    fn emit(&self, event: PropagatorEvent) {
        let _ = self.events.send(event);
    }

    /// Commits the server-assigned metadata of an uploaded file and converts
    /// any VFS placeholder. The error string feeds the item's error message.
    async fn update_metadata(
        &self,
        item: &SyncFileItem,
    ) -> Result<ConvertToPlaceholderResult, String> {
        let record = FileRecord {
            path: item.file.clone(),
            etag: item.etag.clone(),
            file_id: item.file_id.clone(),
            modtime: item.modtime,
            size: item.size,
            checksum: item.checksum_header.clone(),
        };
        self.journal
            .upsert_file_record(&record)
            .await
            .map_err(|err| err.to_string())?;
        self.vfs
            .convert_to_placeholder(item, &self.full_local_path(&item.file))
    }
}

/// Uploads a queue of locally-changed files in batched multi-file requests.
///
/// `schedule()` drives one batch per call; the job reports
/// `WaitForFinished`, so the parent scheduler keeps sibling propagation
/// parked until the final state is reached.
pub struct BulkPropagatorJob {
    propagator: Arc<Propagator>,
    items: VecDeque<SyncFileItem>,
    final_status: ItemStatus,
    finished_emitted: bool,
    request_id: String,
    lazy_ops: bool,
    outstanding_polls: usize,
    poll_tx: mpsc::UnboundedSender<PollResult>,
    poll_rx: mpsc::UnboundedReceiver<PollResult>,
}

impl BulkPropagatorJob {
    pub fn new(propagator: Arc<Propagator>, items: VecDeque<SyncFileItem>) -> Self {
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        Self {
            propagator,
            items,
            final_status: ItemStatus::NoStatus,
            finished_emitted: false,
            request_id: format!("{:032x}", rand::random::<u128>()),
            lazy_ops: lazy_ops_enabled(),
            outstanding_polls: 0,
            poll_tx,
            poll_rx,
        }
    }

    pub fn parallelism(&self) -> JobParallelism {
        JobParallelism::WaitForFinished
    }

    pub fn remaining_items(&self) -> usize {
        self.items.len()
    }

    pub fn outstanding_polls(&self) -> usize {
        self.outstanding_polls
    }

    /// Processes the next batch of queued items, or waits out the remaining
    /// poll jobs once the queue is drained. Safe to call again after the job
    /// finished; the final state is reported without re-emitting `finished`.
    pub async fn schedule(&mut self) -> JobState {
        self.drain_finished_polls().await;

        if self.items.is_empty() {
            while self.outstanding_polls > 0 {
                match self.poll_rx.recv().await {
                    Some(result) => self.on_poll_done(result).await,
                    None => break,
                }
            }
            if !self.finished_emitted {
                self.finished_emitted = true;
                if self.final_status == ItemStatus::NoStatus {
                    self.final_status = ItemStatus::Success;
                }
                info!(final_status = ?self.final_status, "bulk propagation finished");
                self.propagator
                    .emit(PropagatorEvent::Finished(self.final_status));
            }
            return JobState::Finished(self.final_status);
        }

        let take = self.items.len().min(BATCH_SIZE);
        let batch: Vec<SyncFileItem> = self.items.drain(..take).collect();
        info!(
            files = batch.len(),
            remaining = self.items.len(),
            "starting upload batch"
        );
        self.process_batch(batch).await;
        JobState::Running
    }

    /// Drives `schedule()` until the job reaches its final state.
    pub async fn run(&mut self) -> ItemStatus {
        loop {
            if let JobState::Finished(status) = self.schedule().await {
                return status;
            }
        }
    }

    /// Terminal bookkeeping for one item: abort demotion, restoration
    /// mapping, blacklist interplay, completion event and the job-wide final
    /// status. The blacklist step may reclassify the item, so it runs before
    /// the final status is derived.
    async fn done(&mut self, mut item: SyncFileItem, status: ItemStatus, error_string: String) {
        item.status = status;
        item.error_string = error_string;

        // An abort is in progress: keep hard failures retryable next run.
        if self.propagator.abort_requested()
            && matches!(
                item.status,
                ItemStatus::NormalError | ItemStatus::FatalError
            )
        {
            item.status = ItemStatus::SoftError;
        }

        if item.is_restoration {
            match item.status {
                ItemStatus::Success | ItemStatus::Conflict => {
                    item.status = ItemStatus::Restoration;
                }
                _ => {
                    item.error_string = format!("; Restoration Failed: {}", item.error_string);
                }
            }
        }

        match item.status {
            ItemStatus::SoftError
            | ItemStatus::NormalError
            | ItemStatus::FatalError
            | ItemStatus::DetailError => {
                if let Err(err) =
                    blacklist::blacklist_update(&self.propagator.journal, &mut item).await
                {
                    warn!(file = %item.file, %err, "could not update error blacklist");
                }
            }
            ItemStatus::Success | ItemStatus::Restoration => {
                if let Err(err) = blacklist::wipe_on_success(&self.propagator.journal, &item).await
                {
                    warn!(file = %item.file, %err, "could not clear error blacklist");
                }
            }
            _ => {}
        }

        let completed_status = item.status;
        info!(
            file = %item.file,
            status = ?completed_status,
            instruction = ?item.instruction,
            error = %item.error_string,
            "item completed"
        );
        self.propagator.emit(PropagatorEvent::ItemCompleted(item));

        match completed_status {
            ItemStatus::BlacklistedError
            | ItemStatus::Conflict
            | ItemStatus::FatalError
            | ItemStatus::FileIgnored
            | ItemStatus::FileLocked
            | ItemStatus::FileNameInvalid
            | ItemStatus::NoStatus
            | ItemStatus::NormalError
            | ItemStatus::Restoration
            | ItemStatus::SoftError => {
                self.final_status = ItemStatus::NormalError;
                debug!(status = ?completed_status, "final status set to NormalError");
            }
            ItemStatus::DetailError => {
                self.final_status = ItemStatus::DetailError;
                debug!(status = ?completed_status, "final status set to DetailError");
            }
            ItemStatus::Success => {}
        }

        if completed_status == ItemStatus::FatalError {
            self.propagator.abort(AbortKind::Asynchronous);
        }
    }
}

fn lazy_ops_enabled() -> bool {
    std::env::var("OWNCLOUD_LAZYOPS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .map(|value| value != 0)
        .unwrap_or(false)
}

/// Shared failure-classification policy for the bulk request.
pub fn classify_error(
    err: &DavError,
    http_code: u16,
    another_sync_needed: &mut bool,
    error_body: &str,
) -> ItemStatus {
    if http_code == 0 {
        if err.is_timeout() {
            *another_sync_needed = true;
            return ItemStatus::SoftError;
        }
        if err.is_connect() {
            return ItemStatus::FatalError;
        }
        return ItemStatus::NormalError;
    }
    match http_code {
        412 => {
            *another_sync_needed = true;
            ItemStatus::SoftError
        }
        423 => ItemStatus::FileLocked,
        503 if error_body.contains("Storage is temporarily not available") => ItemStatus::SoftError,
        _ => ItemStatus::NormalError,
    }
}

/// Scales a network timeout with the upload size: three minutes per gigabyte
/// of data, never below the job default and never above half an hour.
#[allow(dead_code)]
fn adjust_job_timeout(default_timeout: Duration, file_size: i64) -> Duration {
    const THREE_MINUTES_MS: f64 = 3.0 * 60.0 * 1000.0;
    const MAX_MS: u64 = 30 * 60 * 1000;
    let scaled = (THREE_MINUTES_MS * file_size.max(0) as f64 / 1e9).round() as u64;
    let default_ms = (default_timeout.as_millis() as u64).min(MAX_MS);
    Duration::from_millis(scaled.clamp(default_ms, MAX_MS))
}

include!("propagator_impl_build.rs");
include!("propagator_impl_finish.rs");

#[cfg(test)]
#[path = "propagator_tests/mod.rs"]
mod tests;
