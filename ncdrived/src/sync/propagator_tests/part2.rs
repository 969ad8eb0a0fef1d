#[tokio::test]
async fn quota_guess_refuses_the_upload_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "big.bin", &[b'x'; 200]);
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    propagator.set_folder_quota(".", 100);

    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "big.bin")]);
    assert_eq!(job.run().await, ItemStatus::DetailError);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::DetailError);
    assert_eq!(items[0].http_error_code, 507);
    assert_eq!(
        items[0].error_string,
        "Upload of 200 B exceeds the quota for the folder"
    );
    assert!(
        events
            .iter()
            .any(|event| matches!(event, PropagatorEvent::InsufficientRemoteStorage))
    );
    assert_eq!(finished_statuses(&events), vec![ItemStatus::DetailError]);

    // Refused before any journal write.
    assert!(!propagator.journal().upload_info("big.bin").await.unwrap().valid);
}

#[tokio::test]
async fn case_clashing_sibling_fails_the_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "README.md", b"upper");
    aged_file(dir.path(), "readme.md", b"lower");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "README.md")]);
    assert_eq!(job.run().await, ItemStatus::NormalError);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::NormalError);
    assert!(items[0].error_string.contains("differing only in case"));
    assert!(
        !propagator
            .journal()
            .upload_info("README.md")
            .await
            .unwrap()
            .valid
    );
}

#[tokio::test]
async fn files_still_being_written_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    // Freshly written: the mtime is "now".
    std::fs::write(dir.path().join("fresh.txt"), b"still changing").unwrap();
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "fresh.txt")]);
    job.run().await;

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::SoftError);
    assert_eq!(items[0].error_string, "Local file changed during sync.");
    assert!(propagator.another_sync_needed());
}

#[tokio::test]
async fn far_future_mtimes_are_uploaded_anyway() {
    let server = MockServer::start().await;
    mount_bulk_reply(&server, vec![bulk_reply_entry("/clock.txt", "abc", "fid1")]).await;

    let dir = tempdir().unwrap();
    let file = dir.path().join("clock.txt");
    std::fs::write(&file, b"future").unwrap();
    set_mtime(&file, now_unix() + 60);
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "clock.txt")]);
    assert_eq!(job.run().await, ItemStatus::Success);

    let events = drain_events(&mut events_rx);
    assert_eq!(completed_items(&events)[0].status, ItemStatus::Success);
}

#[tokio::test]
async fn removed_file_is_a_soft_error() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let item = SyncFileItem::new("gone.txt", 5, now_unix() - 3600, Instruction::New);
    let mut job = make_job(&propagator, vec![item]);
    job.run().await;

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::SoftError);
    assert!(items[0].error_string.contains("File Removed (start upload)"));
}

#[tokio::test]
async fn modification_during_hashing_skips_the_upload() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"payload");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, Vec::new());

    // The baseline recorded before hashing no longer matches the disk.
    let mut item = queued_item(dir.path(), "a.txt");
    item.modtime -= 50;
    let file_to_upload = UploadFileInfo {
        rel_file: item.file.clone(),
        abs_local_path: dir.path().join("a.txt"),
        size: item.size,
    };

    let entry = job
        .start_upload_file(item, file_to_upload, "digest".to_string())
        .await;
    assert!(entry.is_none());
    assert!(propagator.another_sync_needed());

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::SoftError);
    assert_eq!(
        items[0].error_string,
        "Local file changed during syncing. It will be resumed."
    );
}

#[tokio::test]
async fn quota_shrinks_by_the_uploaded_sizes() {
    let server = MockServer::start().await;
    mount_bulk_reply(
        &server,
        vec![
            bulk_reply_entry("/Docs/a.txt", "ea", "fa"),
            bulk_reply_entry("/Docs/b.txt", "eb", "fb"),
        ],
    )
    .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "Docs/a.txt", &[b'x'; 100]);
    aged_file(dir.path(), "Docs/b.txt", &[b'y'; 200]);
    let (propagator, _events_rx) = make_propagator(&server, dir.path()).await;
    propagator.set_folder_quota("Docs", 10_000);

    let mut job = make_job(
        &propagator,
        vec![
            queued_item(dir.path(), "Docs/a.txt"),
            queued_item(dir.path(), "Docs/b.txt"),
        ],
    );
    assert_eq!(job.run().await, ItemStatus::Success);

    assert_eq!(propagator.folder_quota("Docs"), Some(10_000 - 300));
}

#[tokio::test]
async fn if_match_follows_the_etag_and_instruction_rule() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, _events_rx) = make_propagator(&server, dir.path()).await;
    let job = make_job(&propagator, Vec::new());

    let mut item = SyncFileItem::new("a.txt", 5, 1000, Instruction::Sync);
    item.etag = "abc".to_string();
    let headers = job.headers(&item).await;
    assert_eq!(header_value(&headers, "If-Match"), Some("\"abc\""));
    assert_eq!(
        header_value(&headers, "Content-Type"),
        Some("application/octet-stream")
    );
    assert_eq!(header_value(&headers, "X-File-Mtime"), Some("1000"));

    // New files never send a precondition.
    item.instruction = Instruction::New;
    let headers = job.headers(&item).await;
    assert_eq!(header_value(&headers, "If-Match"), None);

    item.instruction = Instruction::TypeChange;
    let headers = job.headers(&item).await;
    assert_eq!(header_value(&headers, "If-Match"), None);

    // The sentinel etag counts as absent.
    item.instruction = Instruction::Sync;
    item.etag = "empty_etag".to_string();
    let headers = job.headers(&item).await;
    assert_eq!(header_value(&headers, "If-Match"), None);

    item.etag = String::new();
    let headers = job.headers(&item).await;
    assert_eq!(header_value(&headers, "If-Match"), None);
}

#[tokio::test]
async fn conflict_record_and_recall_tag_shape_the_headers() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, _events_rx) = make_propagator(&server, dir.path()).await;

    propagator
        .journal()
        .set_conflict_record(
            "Docs/A (conflicted copy).txt",
            &ConflictRecord {
                initial_base_path: "Docs/A.txt".to_string(),
                base_file_id: "fid7".to_string(),
                base_modtime: -1,
                base_etag: "etag7".to_string(),
            },
        )
        .await
        .unwrap();

    let job = make_job(&propagator, Vec::new());
    let item = SyncFileItem::new("Docs/A (conflicted copy).txt", 5, 1000, Instruction::New);
    let headers = job.headers(&item).await;
    assert_eq!(header_value(&headers, "OC-Conflict"), Some("1"));
    assert_eq!(
        header_value(&headers, "OC-ConflictInitialBasePath"),
        Some("Docs/A.txt")
    );
    assert_eq!(header_value(&headers, "OC-ConflictBaseFileId"), Some("fid7"));
    assert_eq!(header_value(&headers, "OC-ConflictBaseEtag"), Some("etag7"));
    // A -1 base modtime is "unknown" and stays out of the headers.
    assert_eq!(header_value(&headers, "OC-ConflictBaseMtime"), None);

    let recall = SyncFileItem::new("share/.sys.admin#recall#", 5, 1000, Instruction::New);
    let headers = job.headers(&recall).await;
    assert_eq!(header_value(&headers, "OC-Tag"), Some(".sys.admin#recall#"));
}

#[tokio::test]
async fn lazy_ops_header_follows_the_environment() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, _events_rx) = make_propagator(&server, dir.path()).await;

    unsafe { std::env::set_var("OWNCLOUD_LAZYOPS", "1") };
    let job = make_job(&propagator, Vec::new());
    unsafe { std::env::remove_var("OWNCLOUD_LAZYOPS") };

    let item = SyncFileItem::new("a.txt", 5, 1000, Instruction::New);
    let headers = job.headers(&item).await;
    assert_eq!(header_value(&headers, "OC-LazyOps"), Some("true"));
}
