#[tokio::test]
async fn precondition_failure_schedules_discovery_and_parks_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(412).set_body_string("precondition failed"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"first");
    aged_file(dir.path(), "b.txt", b"second");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut job = make_job(
        &propagator,
        vec![
            queued_item(dir.path(), "a.txt"),
            queued_item(dir.path(), "b.txt"),
        ],
    );
    assert_eq!(job.run().await, ItemStatus::NormalError);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items.len(), 2);

    // The failing file: classified soft, counted, and queued for remote
    // discovery.
    assert_eq!(items[0].file, "a.txt");
    assert_eq!(items[0].status, ItemStatus::SoftError);
    assert_eq!(items[0].http_error_code, 412);
    let info = propagator.journal().upload_info("a.txt").await.unwrap();
    assert!(info.valid);
    assert_eq!(info.error_count, 1);
    let parent = propagator.journal().file_record(".").await.unwrap().unwrap();
    assert_eq!(parent.etag, crate::sync::journal::INVALID_ETAG);
    assert!(propagator.another_sync_needed());

    // The sibling was parked, not retried: no error count, record intact.
    assert_eq!(items[1].file, "b.txt");
    assert_eq!(items[1].status, ItemStatus::SoftError);
    let sibling = propagator.journal().upload_info("b.txt").await.unwrap();
    assert!(sibling.valid);
    assert_eq!(sibling.error_count, 0);
}

#[tokio::test]
async fn upload_info_survives_a_failed_put() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"payload");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "a.txt")]);
    job.run().await;

    // Journal-before-wire: the record written before the PUT is still there
    // for reconcile to use.
    let info = propagator.journal().upload_info("a.txt").await.unwrap();
    assert!(info.valid);
    assert!(info.content_checksum.starts_with("MD5:"));

    // A hard error during an abort is demoted so the next run retries.
    let events = drain_events(&mut events_rx);
    assert_eq!(completed_items(&events)[0].status, ItemStatus::SoftError);
}

#[tokio::test]
async fn repeated_resettable_errors_clear_the_upload_info() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, _events_rx) = make_propagator(&server, dir.path()).await;

    propagator
        .journal()
        .set_upload_info(
            "a.txt",
            &UploadInfo {
                valid: true,
                modtime: 1000,
                content_checksum: "MD5:abc".to_string(),
                size: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = make_job(&propagator, Vec::new());
    let mut item = SyncFileItem::new("a.txt", 5, 1000, Instruction::New);
    item.http_error_code = 412;

    for round in 1..=3 {
        job.check_resetting_errors(&item).await;
        let info = propagator.journal().upload_info("a.txt").await.unwrap();
        assert!(info.valid);
        assert_eq!(info.error_count, round);
    }

    // The fourth consecutive resettable error exceeds the cap and wipes the
    // record entirely.
    job.check_resetting_errors(&item).await;
    assert!(!propagator.journal().upload_info("a.txt").await.unwrap().valid);
}

#[tokio::test]
async fn non_resettable_codes_leave_the_error_count_alone() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, _events_rx) = make_propagator(&server, dir.path()).await;

    propagator
        .journal()
        .set_upload_info(
            "a.txt",
            &UploadInfo {
                valid: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = make_job(&propagator, Vec::new());
    let mut item = SyncFileItem::new("a.txt", 5, 1000, Instruction::New);
    item.http_error_code = 500;
    job.check_resetting_errors(&item).await;

    let info = propagator.journal().upload_info("a.txt").await.unwrap();
    assert!(info.valid);
    assert_eq!(info.error_count, 0);
}

#[tokio::test]
async fn metadata_failure_is_fatal_and_aborts_the_siblings() {
    let server = MockServer::start().await;
    mount_bulk_reply(
        &server,
        vec![
            bulk_reply_entry("/a.txt", "ea", "fa"),
            bulk_reply_entry("/b.txt", "eb", "fb"),
        ],
    )
    .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"first");
    aged_file(dir.path(), "b.txt", b"second");
    let vfs = Arc::new(TestVfs {
        fail_for: Some("a.txt".to_string()),
        ..Default::default()
    });
    let (propagator, mut events_rx) =
        make_propagator_with_vfs(&server, dir.path(), vfs).await;

    let mut job = make_job(
        &propagator,
        vec![
            queued_item(dir.path(), "a.txt"),
            queued_item(dir.path(), "b.txt"),
        ],
    );
    assert_eq!(job.run().await, ItemStatus::NormalError);

    assert!(propagator.abort_requested());
    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].file, "a.txt");
    assert_eq!(items[0].status, ItemStatus::FatalError);
    assert!(
        items[0]
            .error_string
            .contains("Error updating metadata: placeholder conversion failed")
    );
    assert_eq!(items[1].file, "b.txt");
    assert_eq!(items[1].status, ItemStatus::SoftError);
}

#[tokio::test]
async fn locked_placeholder_is_a_soft_error() {
    let server = MockServer::start().await;
    mount_bulk_reply(&server, vec![bulk_reply_entry("/a.txt", "ea", "fa")]).await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"payload");
    let vfs = Arc::new(TestVfs {
        locked_for: Some("a.txt".to_string()),
        ..Default::default()
    });
    let (propagator, mut events_rx) =
        make_propagator_with_vfs(&server, dir.path(), vfs).await;

    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "a.txt")]);
    job.run().await;

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::SoftError);
    assert_eq!(
        items[0].error_string,
        "The file a.txt is currently in use"
    );
}

#[tokio::test]
async fn change_during_upload_is_tolerated_once_the_server_has_an_etag() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", &[b'x'; 100]);

    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(GrowFileResponder {
            path: dir.path().join("a.txt"),
            template: ResponseTemplate::new(200).set_body_json(serde_json::Value::Array(vec![
                bulk_reply_entry("/a.txt", "abc", "fid1"),
            ])),
        })
        .mount(&server)
        .await;

    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "a.txt")]);
    assert_eq!(job.run().await, ItemStatus::Success);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[0].etag, "abc");
    assert!(propagator.another_sync_needed());
}

#[tokio::test]
async fn new_files_lose_their_online_only_pin() {
    let server = MockServer::start().await;
    mount_bulk_reply(&server, vec![bulk_reply_entry("/a.txt", "ea", "fa")]).await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"payload");
    let vfs = Arc::new(TestVfs::default());
    vfs.pin_states
        .lock()
        .unwrap()
        .insert("a.txt".to_string(), PinState::OnlineOnly);
    let (propagator, _events_rx) =
        make_propagator_with_vfs(&server, dir.path(), vfs.clone()).await;

    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "a.txt")]);
    assert_eq!(job.run().await, ItemStatus::Success);

    let calls = vfs.set_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], ("a.txt".to_string(), PinState::Unspecified));
}
