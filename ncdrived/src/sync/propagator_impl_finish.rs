struct PollResult {
    item: SyncFileItem,
    file_to_upload: UploadFileInfo,
    outcome: Result<PollOutcome, DavError>,
}

enum PollOutcome {
    Finished,
    Failed { error: String },
    TimedOut,
}

impl BulkPropagatorJob {
    /// Moves the batched bodies into one multi-file request and routes the
    /// per-file replies. The request is raced against the abort flag.
    async fn trigger_upload(&mut self, entries: Vec<BulkUploadEntry>) {
        let mut pending: Vec<(SyncFileItem, UploadFileInfo, String)> =
            Vec::with_capacity(entries.len());
        let mut parts = Vec::with_capacity(entries.len());
        for entry in entries {
            parts.push(OneUploadFileData {
                headers: entry.headers,
                body: entry.device.into_body_stream(),
            });
            pending.push((entry.item, entry.file_to_upload, entry.remote_path));
        }

        let permit = match self.propagator.bandwidth.acquire_upload().await {
            Ok(permit) => Some(permit),
            Err(err) => {
                warn!(%err, "upload limiter unavailable, sending unthrottled");
                None
            }
        };

        info!(files = pending.len(), "sending bulk upload");
        let request = self
            .propagator
            .account
            .put_multi_file(&self.request_id, parts);
        let result = tokio::select! {
            _ = self.propagator.abort_requested.cancelled() => None,
            result = request => Some(result),
        };
        drop(permit);

        match result {
            None => {
                info!("bulk upload aborted");
                for (item, _, _) in pending {
                    self.done(item, ItemStatus::SoftError, "Upload was aborted".to_string())
                        .await;
                }
            }
            Some(result) => self.on_put_finished(pending, result).await,
        }
    }

    async fn on_put_finished(
        &mut self,
        pending: Vec<(SyncFileItem, UploadFileInfo, String)>,
        result: Result<ncdrive_core::BulkReply, DavError>,
    ) {
        let response_time_stamp = now_unix();
        match result {
            Err(err) => {
                let http_code = err.http_status().map(|status| status.as_u16()).unwrap_or(0);
                let body = err.error_body().unwrap_or_default().to_string();
                warn!(%err, http_code, "bulk upload failed");

                // The failure is attributed to the first pending item; the
                // abort it raises parks the rest of the batch for the next
                // sync run.
                let mut pending = pending.into_iter();
                if let Some((mut item, file_to_upload, _)) = pending.next() {
                    item.http_error_code = http_code;
                    item.response_time_stamp = response_time_stamp;
                    item.request_id = self.request_id.clone();
                    self.common_error_handling(item, &file_to_upload, &err, &body)
                        .await;
                }
                for (item, _, _) in pending {
                    self.done(item, ItemStatus::SoftError, "Upload was aborted".to_string())
                        .await;
                }
            }
            Ok(reply) => {
                debug!(
                    status = %reply.status,
                    replies = reply.replies().len(),
                    "bulk upload reply"
                );
                for (mut item, file_to_upload, remote_path) in pending {
                    if self.propagator.abort_requested() {
                        self.done(item, ItemStatus::SoftError, "Upload was aborted".to_string())
                            .await;
                        continue;
                    }
                    item.http_error_code = reply.status.as_u16();
                    item.response_time_stamp = response_time_stamp;
                    item.request_id = self.request_id.clone();
                    let file_reply = reply.reply_for(&remote_path);
                    self.process_file_reply(item, file_to_upload, file_reply)
                        .await;
                }
            }
        }
    }

    async fn process_file_reply(
        &mut self,
        mut item: SyncFileItem,
        file_to_upload: UploadFileInfo,
        file_reply: FileReply,
    ) {
        // The server needs more time to process the body; it hands out a
        // poll URL instead of an etag.
        if item.http_error_code == 202 {
            let poll_url = file_reply
                .header("OC-JobStatus-Location")
                .unwrap_or_default()
                .to_string();
            if poll_url.is_empty() {
                self.done(item, ItemStatus::NormalError, "Poll URL missing".to_string())
                    .await;
                return;
            }
            self.start_poll_job(item, file_to_upload, poll_url).await;
            return;
        }

        let oc_etag = file_reply
            .header("OC-ETag")
            .map(parse_etag)
            .unwrap_or_default();
        let plain_etag = file_reply
            .header("ETag")
            .map(parse_etag)
            .unwrap_or_default();
        if !oc_etag.is_empty() && !plain_etag.is_empty() && oc_etag != plain_etag {
            warn!(
                file = %item.file,
                %oc_etag,
                %plain_etag,
                "OC-ETag and ETag disagree, keeping OC-ETag"
            );
        }
        let etag = if oc_etag.is_empty() { plain_etag } else { oc_etag };
        // Only a server-assigned version makes the upload final; without one
        // a local change below must stop the file from being recorded.
        let finished = !etag.is_empty();

        let full_file_path = self.propagator.full_local_path(&item.file);
        if !filesystem::file_exists(&full_file_path) {
            if !finished {
                self.abort_with_error(
                    item,
                    ItemStatus::SoftError,
                    "The local file was removed during sync.".to_string(),
                )
                .await;
                return;
            }
            self.propagator.set_another_sync_needed();
        }

        if !filesystem::verify_file_unchanged(&full_file_path, item.size, item.modtime) {
            self.propagator.set_another_sync_needed();
            if !finished {
                self.abort_with_error(
                    item,
                    ItemStatus::SoftError,
                    "Local file changed during sync.".to_string(),
                )
                .await;
                return;
            }
        }

        if let Some(file_id) = file_reply.header("OC-FileID")
            && !file_id.is_empty()
        {
            if !item.file_id.is_empty() && item.file_id != file_id {
                warn!(
                    file = %item.file,
                    old = %item.file_id,
                    new = %file_id,
                    "file id changed"
                );
            }
            item.file_id = file_id.to_string();
        }
        item.etag = etag;

        if file_reply.header("X-OC-MTime") != Some("accepted") {
            warn!(file = %item.file, "server did not accept the requested modification time");
        }

        self.finalize(item, file_to_upload).await;
    }

    /// Network or HTTP failure during the bulk request.
    async fn common_error_handling(
        &mut self,
        mut item: SyncFileItem,
        file_to_upload: &UploadFileInfo,
        err: &DavError,
        error_body: &str,
    ) {
        debug!(file = %item.file, body = error_body, "bulk upload error body");
        let mut error_string = err.to_string();

        if item.http_error_code == 412 {
            // Precondition failed: etag or checksum mismatch. A stale etag
            // may sit in the database, so the parent folder must be
            // re-listed remotely next sync.
            if let Err(journal_err) = self
                .propagator
                .journal
                .schedule_path_for_remote_discovery(&item.file)
                .await
            {
                warn!(file = %item.file, %journal_err, "could not schedule remote discovery");
            }
            self.propagator.set_another_sync_needed();
        }

        self.check_resetting_errors(&item).await;

        let mut another_sync_needed = false;
        let mut status = classify_error(
            err,
            item.http_error_code,
            &mut another_sync_needed,
            error_body,
        );
        if another_sync_needed {
            self.propagator.set_another_sync_needed();
        }

        if item.http_error_code == 507 {
            // Remember the refusal so the rest of this run stops trying
            // larger files in the same folder.
            let folder = parent_dir(&item.file);
            self.propagator
                .shrink_folder_quota(&folder, file_to_upload.size - 1);
            status = ItemStatus::DetailError;
            error_string = format!(
                "Upload of {} exceeds the quota for the folder",
                octets_to_string(file_to_upload.size)
            );
            self.propagator
                .emit(PropagatorEvent::InsufficientRemoteStorage);
        }

        self.abort_with_error(item, status, error_string).await;
    }

    /// Errors like 412 eventually reset the upload record entirely so the
    /// next sync starts from scratch instead of repeating the same failure.
    async fn check_resetting_errors(&self, item: &SyncFileItem) {
        let capabilities = self.propagator.account.capabilities();
        if item.http_error_code != 412
            && !capabilities.reset_error_codes.contains(&item.http_error_code)
        {
            return;
        }

        let journal = &self.propagator.journal;
        match journal.upload_info(&item.file).await {
            Ok(mut upload_info) => {
                upload_info.error_count += 1;
                if upload_info.error_count > 3 {
                    info!(
                        file = %item.file,
                        http_error_code = item.http_error_code,
                        "resetting upload after repeated error"
                    );
                    upload_info = UploadInfo::default();
                } else {
                    info!(
                        file = %item.file,
                        error_count = upload_info.error_count,
                        http_error_code = item.http_error_code,
                        "maybe-reset error recorded"
                    );
                }
                if let Err(err) = journal.set_upload_info(&item.file, &upload_info).await {
                    warn!(file = %item.file, %err, "could not update upload info");
                }
                journal.commit("Upload info");
            }
            Err(err) => warn!(file = %item.file, %err, "could not read upload info"),
        }
    }

    /// A successfully uploaded file: quota cache, metadata commit, pin-state
    /// demotion, durable-record cleanup and the completion event.
    async fn finalize(&mut self, item: SyncFileItem, file_to_upload: UploadFileInfo) {
        let propagator = Arc::clone(&self.propagator);

        propagator.decrement_folder_quota(&parent_dir(&item.file), file_to_upload.size);

        match propagator.update_metadata(&item).await {
            Err(error) => {
                self.done(
                    item,
                    ItemStatus::FatalError,
                    format!("Error updating metadata: {error}"),
                )
                .await;
                return;
            }
            Ok(ConvertToPlaceholderResult::Locked) => {
                let message = format!("The file {} is currently in use", item.file);
                self.done(item, ItemStatus::SoftError, message).await;
                return;
            }
            Ok(ConvertToPlaceholderResult::Ok) => {}
        }

        // Files new on the remote should not stay online-only even when
        // their parent folder is.
        if matches!(item.instruction, Instruction::New | Instruction::TypeChange)
            && propagator.vfs.pin_state(&item.file) == Some(PinState::OnlineOnly)
            && !propagator.vfs.set_pin_state(&item.file, PinState::Unspecified)
        {
            warn!(file = %item.file, "could not set pin state to unspecified");
        }

        if let Err(err) = propagator
            .journal
            .set_upload_info(&item.file, &UploadInfo::default())
            .await
        {
            warn!(file = %item.file, %err, "could not clear upload info");
        }
        propagator.journal.commit("upload file start");

        self.done(item, ItemStatus::Success, String::new()).await;
    }

    async fn abort_with_error(&mut self, item: SyncFileItem, status: ItemStatus, error: String) {
        self.propagator.abort(AbortKind::Synchronous);
        self.done(item, status, error).await;
    }

    /// Registers the poll durably, then chases the poll URL from a spawned
    /// task. Outstanding polls block overall completion but not the next
    /// batch.
    async fn start_poll_job(
        &mut self,
        item: SyncFileItem,
        file_to_upload: UploadFileInfo,
        poll_url: String,
    ) {
        let poll_info = PollInfo {
            file: item.file.clone(),
            url: poll_url.clone(),
            modtime: item.modtime,
            file_size: item.size,
        };
        if let Err(err) = self.propagator.journal.set_poll_info(&poll_info).await {
            warn!(file = %item.file, %err, "could not persist poll info");
        }
        self.propagator.journal.commit("add poll info");
        info!(file = %item.file, url = %poll_url, "deferred processing, polling for completion");
        self.spawn_poll(item, file_to_upload, poll_url);
    }

    fn spawn_poll(&mut self, item: SyncFileItem, file_to_upload: UploadFileInfo, poll_url: String) {
        self.outstanding_polls += 1;
        let account = self.propagator.account.clone();
        let max_attempts = self.propagator.options.poll_max_attempts;
        let poll_tx = self.poll_tx.clone();
        tokio::spawn(async move {
            let outcome = run_poll(&account, &poll_url, max_attempts).await;
            let _ = poll_tx.send(PollResult {
                item,
                file_to_upload,
                outcome,
            });
        });
    }

    /// Restores poll jobs left in the journal by a run that ended before its
    /// deferred uploads completed.
    pub async fn resume_polls(&mut self) -> Result<usize, PropagatorError> {
        let poll_infos = self.propagator.journal.poll_infos().await?;
        for poll_info in &poll_infos {
            let mut item = SyncFileItem::new(
                poll_info.file.clone(),
                poll_info.file_size,
                poll_info.modtime,
                Instruction::Sync,
            );
            item.request_id = self.request_id.clone();
            let file_to_upload = UploadFileInfo {
                rel_file: poll_info.file.clone(),
                abs_local_path: self.propagator.full_local_path(&poll_info.file),
                size: poll_info.file_size,
            };
            info!(file = %poll_info.file, url = %poll_info.url, "resuming poll from journal");
            self.spawn_poll(item, file_to_upload, poll_info.url.clone());
        }
        Ok(poll_infos.len())
    }

    async fn on_poll_done(&mut self, result: PollResult) {
        self.outstanding_polls -= 1;
        let PollResult {
            item,
            file_to_upload,
            outcome,
        } = result;

        match outcome {
            Ok(PollOutcome::Finished) => {
                if let Err(err) = self.propagator.journal.remove_poll_info(&item.file).await {
                    warn!(file = %item.file, %err, "could not remove poll info");
                }
                self.propagator.journal.commit("remove poll info");
                self.finalize(item, file_to_upload).await;
            }
            Ok(PollOutcome::Failed { error }) => {
                if let Err(err) = self.propagator.journal.remove_poll_info(&item.file).await {
                    warn!(file = %item.file, %err, "could not remove poll info");
                }
                self.propagator.journal.commit("remove poll info");
                self.done(item, ItemStatus::NormalError, error).await;
            }
            Ok(PollOutcome::TimedOut) => {
                // The poll info stays so the next run resumes the poll.
                self.done(
                    item,
                    ItemStatus::SoftError,
                    "Asynchronous processing did not finish in time".to_string(),
                )
                .await;
            }
            Err(err) => {
                self.done(item, ItemStatus::SoftError, err.to_string()).await;
            }
        }
    }

    async fn drain_finished_polls(&mut self) {
        while let Ok(result) = self.poll_rx.try_recv() {
            self.on_poll_done(result).await;
        }
    }
}

async fn run_poll(
    account: &Account,
    poll_url: &str,
    max_attempts: u32,
) -> Result<PollOutcome, DavError> {
    for attempt in 0..max_attempts {
        let reply = account.poll_job_status(poll_url).await?;
        match reply.status {
            PollStatus::Finished => return Ok(PollOutcome::Finished),
            PollStatus::Error => {
                return Ok(PollOutcome::Failed {
                    error: reply
                        .error
                        .unwrap_or_else(|| "asynchronous processing failed".to_string()),
                });
            }
            PollStatus::Init | PollStatus::Started => {
                tokio::time::sleep(poll_delay(attempt)).await;
            }
        }
    }
    Ok(PollOutcome::TimedOut)
}

fn poll_delay(attempt: u32) -> Duration {
    const BASE_MS: u64 = 1000;
    const MAX_MS: u64 = 30_000;
    let exp = BASE_MS.saturating_mul(1u64 << attempt.min(5)).min(MAX_MS);
    Duration::from_millis(rand::thread_rng().gen_range(exp / 2..=exp))
}
