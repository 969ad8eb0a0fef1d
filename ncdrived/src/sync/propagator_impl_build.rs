/// One file of the pending batch, ready to go over the wire.
struct BulkUploadEntry {
    item: SyncFileItem,
    file_to_upload: UploadFileInfo,
    remote_path: String,
    headers: Vec<(String, String)>,
    device: UploadDevice,
}

enum ChecksumOutcome {
    Ready {
        item: SyncFileItem,
        file_to_upload: UploadFileInfo,
        transmission_digest: String,
    },
    Failed {
        item: SyncFileItem,
        error: String,
    },
    Skipped,
}

impl BulkPropagatorJob {
    async fn process_batch(&mut self, batch: Vec<SyncFileItem>) {
        // Hash the whole batch on worker threads first, then build the batch
        // entries strictly in input order so journal writes stay
        // deterministic.
        let tasks = batch
            .into_iter()
            .map(|item| compute_one_checksum(Arc::clone(&self.propagator), item));
        let outcomes = futures_util::future::join_all(tasks).await;

        let mut entries = Vec::new();
        for outcome in outcomes {
            match outcome {
                ChecksumOutcome::Ready {
                    item,
                    file_to_upload,
                    transmission_digest,
                } => {
                    if let Some(entry) = self
                        .start_upload_file(item, file_to_upload, transmission_digest)
                        .await
                    {
                        entries.push(entry);
                    }
                }
                ChecksumOutcome::Failed { item, error } => {
                    self.done(item, ItemStatus::NormalError, error).await;
                }
                ChecksumOutcome::Skipped => {}
            }
        }

        if entries.is_empty() {
            return;
        }
        self.trigger_upload(entries).await;
    }

    /// Local preconditions, the durable upload record and the streaming body
    /// for one checksummed item. Returns `None` when the item was completed
    /// (or dropped) before reaching the batch.
    async fn start_upload_file(
        &mut self,
        mut item: SyncFileItem,
        mut file_to_upload: UploadFileInfo,
        transmission_digest: String,
    ) -> Option<BulkUploadEntry> {
        let propagator = Arc::clone(&self.propagator);

        if propagator.abort_requested() {
            return None;
        }

        if filesystem::has_case_clash(&propagator.local_root, &file_to_upload.rel_file)
            .unwrap_or(false)
        {
            let message = format!(
                "File {} cannot be uploaded because another file with the same name, differing only in case, exists",
                item.file
            );
            self.done(item, ItemStatus::NormalError, message).await;
            return None;
        }

        // A guess only: the real verdict is the server's, but refusing early
        // avoids burning bandwidth on a certain 507.
        let folder = parent_dir(&file_to_upload.rel_file);
        let quota_guess = propagator.folder_quota(&folder).unwrap_or(i64::MAX);
        if file_to_upload.size > quota_guess {
            item.http_error_code = 507;
            propagator.emit(PropagatorEvent::InsufficientRemoteStorage);
            let message = format!(
                "Upload of {} exceeds the quota for the folder",
                octets_to_string(file_to_upload.size)
            );
            self.done(item, ItemStatus::DetailError, message).await;
            return None;
        }

        if let Some(rename_target) = item.rename_target.clone()
            && rename_target != item.file
        {
            let from = propagator.full_local_path(&item.file);
            let to = propagator.full_local_path(&rename_target);
            if let Err(err) = filesystem::rename(&from, &to) {
                warn!(file = %item.file, %err, "could not rename file before upload");
                self.done(
                    item,
                    ItemStatus::NormalError,
                    "File contains trailing spaces and couldn't be renamed".to_string(),
                )
                .await;
                return None;
            }
            item.file = rename_target.clone();
            file_to_upload.rel_file = rename_target;
            file_to_upload.abs_local_path = to;
            if let Ok(modtime) = filesystem::get_modtime(&file_to_upload.abs_local_path) {
                item.modtime = modtime;
            }
        }

        if !filesystem::file_exists(&file_to_upload.abs_local_path) {
            let message = format!(
                "File Removed (start upload) {}",
                file_to_upload.abs_local_path.display()
            );
            self.done(item, ItemStatus::SoftError, message).await;
            return None;
        }

        // The checksum stage recorded the mtime before hashing; a change
        // since then means the bytes we hashed are not the bytes on disk.
        let original_path = propagator.full_local_path(&item.file);
        let previous_modtime = item.modtime;
        if let Ok(modtime) = filesystem::get_modtime(&original_path) {
            item.modtime = modtime;
        }
        if previous_modtime != item.modtime {
            debug!(
                file = %item.file,
                previous_modtime,
                current = item.modtime,
                "file changed while hashing"
            );
            propagator.set_another_sync_needed();
            self.done(
                item,
                ItemStatus::SoftError,
                "Local file changed during syncing. It will be resumed.".to_string(),
            )
            .await;
            return None;
        }

        if let Ok(size) = filesystem::get_size(&file_to_upload.abs_local_path) {
            file_to_upload.size = size;
        }
        if let Ok(size) = filesystem::get_size(&original_path) {
            item.size = size;
        }

        if filesystem::file_is_still_changing(
            item.modtime,
            propagator.options.minimum_file_age_for_upload,
        ) {
            propagator.set_another_sync_needed();
            self.done(
                item,
                ItemStatus::SoftError,
                "Local file changed during sync.".to_string(),
            )
            .await;
            return None;
        }

        // Durable record first: if the reply to the PUT gets lost, reconcile
        // can match the stored checksum instead of re-uploading blindly.
        let upload_info = UploadInfo {
            valid: true,
            chunk: 0,
            transfer_id: 0,
            modtime: item.modtime,
            error_count: 0,
            content_checksum: item.checksum_header.clone(),
            size: item.size,
        };
        if let Err(err) = propagator
            .journal
            .set_upload_info(&item.file, &upload_info)
            .await
        {
            self.abort_with_error(item, ItemStatus::FatalError, err.to_string())
                .await;
            return None;
        }
        propagator.journal.commit("Upload info");

        let device = match propagator
            .bandwidth
            .open_device(&file_to_upload.abs_local_path, file_to_upload.size)
            .await
        {
            Ok(device) => device,
            Err(err) => {
                warn!(
                    path = %file_to_upload.abs_local_path.display(),
                    %err,
                    "could not prepare upload device"
                );
                if filesystem::is_file_locked(&file_to_upload.abs_local_path) {
                    propagator.emit(PropagatorEvent::SeenLockedFile(
                        file_to_upload.abs_local_path.clone(),
                    ));
                }
                // Likely the user touching files mid-sync; retry next run.
                self.abort_with_error(item, ItemStatus::SoftError, err.to_string())
                    .await;
                return None;
            }
        };

        let remote_path = propagator.full_remote_path(&file_to_upload.rel_file);
        let mut headers = self.headers(&item).await;
        headers.push((
            "Content-Length".to_string(),
            file_to_upload.size.to_string(),
        ));
        headers.push(("X-File-MD5".to_string(), transmission_digest));
        headers.push(("X-File-Path".to_string(), remote_path.clone()));

        Some(BulkUploadEntry {
            item,
            file_to_upload,
            remote_path,
            headers,
            device,
        })
    }

    /// Per-file request headers: content type, mtime, the lazy-ops and
    /// admin-recall tags, the `If-Match` precondition and any conflict
    /// metadata recorded by discovery.
    async fn headers(&self, item: &SyncFileItem) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            ),
            ("X-File-Mtime".to_string(), item.modtime.to_string()),
        ];

        if self.lazy_ops {
            headers.push(("OC-LazyOps".to_string(), "true".to_string()));
        }

        if item.file.contains(".sys.admin#recall#") {
            // Admin-triggered recall; the server may stage these away from
            // the user's area.
            headers.push(("OC-Tag".to_string(), ".sys.admin#recall#".to_string()));
        }

        if !item.etag.is_empty()
            && item.etag != "empty_etag"
            && item.instruction != Instruction::New
            && item.instruction != Instruction::TypeChange
        {
            // The server always quotes etags, so the precondition is sent
            // quoted as well.
            headers.push(("If-Match".to_string(), format!("\"{}\"", item.etag)));
        }

        match self.propagator.journal.conflict_record(&item.file).await {
            Ok(Some(record)) => {
                headers.push(("OC-Conflict".to_string(), "1".to_string()));
                if !record.initial_base_path.is_empty() {
                    headers.push((
                        "OC-ConflictInitialBasePath".to_string(),
                        record.initial_base_path,
                    ));
                }
                if !record.base_file_id.is_empty() {
                    headers.push(("OC-ConflictBaseFileId".to_string(), record.base_file_id));
                }
                if record.base_modtime != -1 {
                    headers.push((
                        "OC-ConflictBaseMtime".to_string(),
                        record.base_modtime.to_string(),
                    ));
                }
                if !record.base_etag.is_empty() {
                    headers.push(("OC-ConflictBaseEtag".to_string(), record.base_etag));
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(file = %item.file, %err, "could not read conflict record");
            }
        }

        headers
    }
}

/// Checksum stage for one item: records the pre-hash mtime baseline, reuses
/// or computes the content digest, then resolves the transmission digest
/// against the account capabilities. Runs concurrently across the batch;
/// hashing itself happens on blocking worker threads.
async fn compute_one_checksum(propagator: Arc<Propagator>, mut item: SyncFileItem) -> ChecksumOutcome {
    if propagator.abort_requested() {
        return ChecksumOutcome::Skipped;
    }

    let file_to_upload = UploadFileInfo {
        rel_file: item.file.clone(),
        abs_local_path: propagator.full_local_path(&item.file),
        size: item.size,
    };

    // Baseline for detecting a modification during hashing. Taken from the
    // original file: that is the one the user keeps editing.
    let original_path = propagator.full_local_path(&item.file);
    if let Ok(modtime) = filesystem::get_modtime(&original_path) {
        item.modtime = modtime;
    }

    let content_type = checksums::CONTENT_CHECKSUM_TYPE;
    let existing = checksums::parse_checksum_header(&item.checksum_header);
    let content_digest = match existing {
        Some((kind, digest)) if kind == content_type => digest,
        _ => {
            match checksums::compute_file_checksum(&file_to_upload.abs_local_path, content_type)
                .await
            {
                Ok(digest) => digest,
                Err(ChecksumError::Io(_))
                    if !filesystem::file_exists(&file_to_upload.abs_local_path) =>
                {
                    // Vanished under us; the batch builder reports it.
                    String::new()
                }
                Err(err) => {
                    return ChecksumOutcome::Failed {
                        item,
                        error: err.to_string(),
                    };
                }
            }
        }
    };
    item.checksum_header = checksums::make_checksum_header(content_type, &content_digest);

    // Reuse the content digest as the transmission digest when the server
    // can verify that type.
    let capabilities = propagator.account.capabilities();
    let transmission_digest = if capabilities
        .supported_checksum_types
        .iter()
        .any(|kind| kind == content_type)
    {
        content_digest
    } else if capabilities.upload_checksums_enabled {
        match checksums::compute_file_checksum(
            &file_to_upload.abs_local_path,
            &capabilities.upload_checksum_type,
        )
        .await
        {
            Ok(digest) => digest,
            Err(err) => {
                return ChecksumOutcome::Failed {
                    item,
                    error: err.to_string(),
                };
            }
        }
    } else {
        String::new()
    };

    if item.checksum_header.is_empty() {
        item.checksum_header = checksums::make_checksum_header(
            &capabilities.upload_checksum_type,
            &transmission_digest,
        );
    }

    ChecksumOutcome::Ready {
        item,
        file_to_upload,
        transmission_digest,
    }
}
