#[tokio::test]
async fn uploads_a_single_file_and_finalizes_it() {
    let server = MockServer::start().await;
    mount_bulk_reply(&server, vec![bulk_reply_entry("/a.txt", "abc", "fid1")]).await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", &[b'x'; 100]);
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "a.txt")]);

    assert_eq!(job.parallelism(), JobParallelism::WaitForFinished);
    assert_eq!(job.run().await, ItemStatus::Success);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[0].etag, "abc");
    assert_eq!(items[0].file_id, "fid1");
    assert_eq!(items[0].http_error_code, 200);
    assert!(!items[0].request_id.is_empty());
    assert!(items[0].checksum_header.starts_with("MD5:"));
    assert_eq!(finished_statuses(&events), vec![ItemStatus::Success]);

    // The durable upload record is gone and the metadata is committed.
    assert!(!propagator.journal().upload_info("a.txt").await.unwrap().valid);
    let record = propagator
        .journal()
        .file_record("a.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.etag, "abc");
    assert_eq!(record.file_id, "fid1");
}

#[tokio::test]
async fn one_schedule_call_moves_at_most_one_hundred_items() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();

    let mut entries = Vec::new();
    let mut queue = Vec::new();
    for index in 0..105 {
        let rel = format!("f{index:03}.txt");
        aged_file(dir.path(), &rel, b"data");
        entries.push(bulk_reply_entry(&format!("/{rel}"), "etag", "fid"));
        queue.push(rel);
    }
    mount_bulk_reply(&server, entries).await;

    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let items = queue
        .iter()
        .map(|rel| queued_item(dir.path(), rel))
        .collect();
    let mut job = make_job(&propagator, items);

    assert_eq!(job.schedule().await, JobState::Running);
    let events = drain_events(&mut events_rx);
    assert_eq!(completed_items(&events).len(), 100);
    assert!(finished_statuses(&events).is_empty());
    assert_eq!(job.remaining_items(), 5);

    assert_eq!(job.run().await, ItemStatus::Success);
    let events = drain_events(&mut events_rx);
    assert_eq!(completed_items(&events).len(), 5);
    assert_eq!(finished_statuses(&events), vec![ItemStatus::Success]);
}

#[tokio::test]
async fn empty_queue_is_idle_and_finished_is_emitted_once() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, Vec::new());

    assert_eq!(job.schedule().await, JobState::Finished(ItemStatus::Success));
    assert_eq!(job.schedule().await, JobState::Finished(ItemStatus::Success));

    let events = drain_events(&mut events_rx);
    assert_eq!(finished_statuses(&events).len(), 1);
}

#[tokio::test]
async fn rename_target_redirects_the_uploaded_body() {
    let server = MockServer::start().await;
    mount_bulk_reply(&server, vec![bulk_reply_entry("/b.txt", "abc", "fid1")]).await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"payload");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;

    let mut item = queued_item(dir.path(), "a.txt");
    item.rename_target = Some("b.txt".to_string());
    let mut job = make_job(&propagator, vec![item]);

    assert_eq!(job.run().await, ItemStatus::Success);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].file, "b.txt");
    assert_eq!(items[0].status, ItemStatus::Success);
    assert!(!dir.path().join("a.txt").exists());
    assert!(dir.path().join("b.txt").exists());
}

#[tokio::test]
async fn correlation_miss_keeps_the_preserved_empty_etag_behavior() {
    let server = MockServer::start().await;
    // The reply array does not mention our file at all.
    mount_bulk_reply(&server, vec![bulk_reply_entry("/other.txt", "zzz", "fid9")]).await;

    let dir = tempdir().unwrap();
    aged_file(dir.path(), "a.txt", b"payload");
    let (propagator, mut events_rx) = make_propagator(&server, dir.path()).await;
    let mut job = make_job(&propagator, vec![queued_item(dir.path(), "a.txt")]);

    assert_eq!(job.run().await, ItemStatus::Success);

    let events = drain_events(&mut events_rx);
    let items = completed_items(&events);
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[0].etag, "");
}
