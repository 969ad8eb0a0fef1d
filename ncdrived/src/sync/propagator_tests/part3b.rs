#[tokio::test]
async fn deferred_processing_registers_a_poll_and_finalizes_later() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!([
            {"X-File-Path": "/slow.bin", "OC-JobStatus-Location": "/poll/123"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/poll/123"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "finished"})),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "slow.bin", b"needs processing");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "slow.bin")]);

    // The batch is done but the poll is outstanding: no finished signal yet.
    assert_eq!(job.schedule().await, JobState::Running);
    assert_eq!(job.outstanding_polls(), 1);
    let poll_info = propagator
        .journal()
        .poll_info("slow.bin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(poll_info.url, "/poll/123");
    assert!(finished_statuses(&drain_events(&mut events_rx)).is_empty());

    assert_eq!(job.run().await, ItemStatus::Success);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(finished_statuses(&events), vec![ItemStatus::Success]);
    assert_eq!(propagator.journal().poll_info("slow.bin").await.unwrap(), None);
    assert!(!propagator.journal().upload_info("slow.bin").await.unwrap().valid);
}

#[tokio::test]
async fn poll_error_fails_the_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!([
            {"X-File-Path": "/slow.bin", "OC-JobStatus-Location": "/poll/err"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/poll/err"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({"status": "error", "error": "processing failed"}),
        ))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "slow.bin", b"needs processing");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "slow.bin")]);
    assert_eq!(job.run().await, ItemStatus::NormalError);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::NormalError);
    assert_eq!(items[0].error_string, "processing failed");
    // A terminal poll result removes the registration.
    assert_eq!(propagator.journal().poll_info("slow.bin").await.unwrap(), None);
}

#[tokio::test]
async fn missing_poll_url_is_a_normal_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!([
            {"X-File-Path": "/slow.bin"}
        ])))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "slow.bin", b"needs processing");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "slow.bin")]);
    job.run().await;

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::NormalError);
    assert_eq!(items[0].error_string, "Poll URL missing");
}

#[tokio::test]
async fn polls_left_by_a_previous_run_are_resumed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poll/old"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "finished"})),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    propagator
        .journal()
        .set_poll_info(&crate::sync::journal::PollInfo {
            file: "leftover.bin".to_string(),
            url: "/poll/old".to_string(),
            modtime: now_unix() - 3600,
            file_size: 12,
        })
        .await
        .unwrap();

    let mut job = make_job(&propagator, Vec::new());
    assert_eq!(job.resume_polls().await.unwrap(), 1);
    assert_eq!(job.run().await, ItemStatus::Success);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].file, "leftover.bin");
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(
        propagator.journal().poll_info("leftover.bin").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn restoration_items_map_success_to_restoration() {
    let server = MockServer::start().await;
    mount_bulk_reply(&server, vec![bulk_reply_entry("/a.txt", "abc", "fid1")]).await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"restored");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut item = queued_item(dir.path(), "a.txt");
    item.is_restoration = true;
    let mut job = make_job(&propagator, vec![item]);
    job.run().await;

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::Restoration);
    // Restoration still degrades the job-wide final status.
    assert_eq!(finished_statuses(&events), vec![ItemStatus::NormalError]);
}

#[tokio::test]
async fn failed_restorations_annotate_the_error_string() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut item = SyncFileItem::new("gone.txt", 5, now_unix() - 3600, Instruction::New);
    item.is_restoration = true;
    let mut job = make_job(&propagator, vec![item]);
    job.run().await;

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert!(items[0].error_string.contains("; Restoration Failed:"));
}

#[test]
fn classify_error_maps_the_documented_codes() {
    let err = DavError::Api {
        status: reqwest_status(412),
        body: String::new(),
    };

    let mut another_sync_needed = false;
    assert_eq!(
        classify_error(&err, 412, &mut another_sync_needed, ""),
        ItemStatus::SoftError
    );
    assert!(another_sync_needed);

    let mut another_sync_needed = false;
    assert_eq!(
        classify_error(&err, 423, &mut another_sync_needed, ""),
        ItemStatus::FileLocked
    );
    assert_eq!(
        classify_error(
            &err,
            503,
            &mut another_sync_needed,
            "Storage is temporarily not available"
        ),
        ItemStatus::SoftError
    );
    assert_eq!(
        classify_error(&err, 503, &mut another_sync_needed, "<html>maintenance</html>"),
        ItemStatus::NormalError
    );
    assert_eq!(
        classify_error(&err, 500, &mut another_sync_needed, ""),
        ItemStatus::NormalError
    );
}

fn reqwest_status(code: u16) -> reqwest::StatusCode {
    reqwest::StatusCode::from_u16(code).unwrap()
}

#[test]
fn job_timeout_scales_with_size_and_saturates() {
    let default = Duration::from_secs(300);
    // Small files keep the default.
    assert_eq!(adjust_job_timeout(default, 100), default);
    // Ten gigabytes: three minutes each, capped at half an hour.
    assert_eq!(
        adjust_job_timeout(default, 10_000_000_000),
        Duration::from_secs(30 * 60)
    );
    // Four gigabytes land on the curve itself.
    assert_eq!(
        adjust_job_timeout(default, 4_000_000_000),
        Duration::from_millis(4 * 3 * 60 * 1000)
    );
}

#[test]
fn poll_delay_is_bounded() {
    for attempt in 0..10 {
        let delay = poll_delay(attempt);
        assert!(delay <= Duration::from_millis(30_000));
    }
}
