use super::*;

async fn make_journal() -> SyncJournal {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let journal = SyncJournal::from_pool(pool);
    journal.init().await.unwrap();
    journal
}

#[tokio::test]
async fn upload_info_roundtrips_and_reads_valid() {
    let journal = make_journal().await;

    let missing = journal.upload_info("Docs/A.txt").await.unwrap();
    assert!(!missing.valid);

    let info = UploadInfo {
        valid: true,
        chunk: 0,
        transfer_id: 0,
        modtime: 1_700_000_000,
        error_count: 0,
        content_checksum: "MD5:abc".to_string(),
        size: 42,
    };
    journal.set_upload_info("Docs/A.txt", &info).await.unwrap();

    let stored = journal.upload_info("Docs/A.txt").await.unwrap();
    assert_eq!(stored, info);
}

#[tokio::test]
async fn invalid_upload_info_deletes_the_row() {
    let journal = make_journal().await;
    let info = UploadInfo {
        valid: true,
        modtime: 1,
        size: 1,
        ..Default::default()
    };
    journal.set_upload_info("a", &info).await.unwrap();
    assert!(journal.upload_info("a").await.unwrap().valid);

    journal
        .set_upload_info("a", &UploadInfo::default())
        .await
        .unwrap();
    assert!(!journal.upload_info("a").await.unwrap().valid);
}

#[tokio::test]
async fn poll_info_roundtrips_and_lists() {
    let journal = make_journal().await;
    let info = PollInfo {
        file: "slow.bin".to_string(),
        url: "/poll/123".to_string(),
        modtime: 1_700_000_000,
        file_size: 10,
    };
    journal.set_poll_info(&info).await.unwrap();

    assert_eq!(journal.poll_info("slow.bin").await.unwrap(), Some(info));
    assert_eq!(journal.poll_infos().await.unwrap().len(), 1);

    journal.remove_poll_info("slow.bin").await.unwrap();
    assert_eq!(journal.poll_info("slow.bin").await.unwrap(), None);
    assert!(journal.poll_infos().await.unwrap().is_empty());
}

#[tokio::test]
async fn conflict_record_roundtrips() {
    let journal = make_journal().await;
    let record = ConflictRecord {
        initial_base_path: "Docs/A.txt".to_string(),
        base_file_id: "fid9".to_string(),
        base_modtime: 1_600_000_000,
        base_etag: "etag9".to_string(),
    };
    journal
        .set_conflict_record("Docs/A (conflicted copy).txt", &record)
        .await
        .unwrap();
    assert_eq!(
        journal
            .conflict_record("Docs/A (conflicted copy).txt")
            .await
            .unwrap(),
        Some(record)
    );
    assert_eq!(journal.conflict_record("Docs/A.txt").await.unwrap(), None);
}

#[tokio::test]
async fn blacklist_entry_roundtrips_and_wipes() {
    let journal = make_journal().await;
    let entry = BlacklistEntry {
        error_string: "server said no".to_string(),
        http_error_code: 403,
        retry_count: 2,
        last_try_modtime: 123,
        last_try_time: 456,
    };
    journal.set_error_blacklist_entry("a", &entry).await.unwrap();
    assert_eq!(
        journal.error_blacklist_entry("a").await.unwrap(),
        Some(entry)
    );

    journal.wipe_error_blacklist_entry("a").await.unwrap();
    assert_eq!(journal.error_blacklist_entry("a").await.unwrap(), None);
}

#[tokio::test]
async fn file_record_upserts() {
    let journal = make_journal().await;
    let mut record = FileRecord {
        path: "Docs/A.txt".to_string(),
        etag: "one".to_string(),
        file_id: "fid1".to_string(),
        modtime: 1,
        size: 5,
        checksum: "MD5:aa".to_string(),
    };
    journal.upsert_file_record(&record).await.unwrap();

    record.etag = "two".to_string();
    journal.upsert_file_record(&record).await.unwrap();

    let stored = journal.file_record("Docs/A.txt").await.unwrap().unwrap();
    assert_eq!(stored.etag, "two");
    assert_eq!(stored.file_id, "fid1");
}

#[tokio::test]
async fn remote_discovery_poisons_the_parent_etag() {
    let journal = make_journal().await;
    journal
        .upsert_file_record(&FileRecord {
            path: "Docs".to_string(),
            etag: "fresh".to_string(),
            file_id: String::new(),
            modtime: 0,
            size: 0,
            checksum: String::new(),
        })
        .await
        .unwrap();

    journal
        .schedule_path_for_remote_discovery("Docs/A.txt")
        .await
        .unwrap();

    let parent = journal.file_record("Docs").await.unwrap().unwrap();
    assert_eq!(parent.etag, INVALID_ETAG);

    // Root-level files poison the "." record even when it did not exist yet.
    journal
        .schedule_path_for_remote_discovery("top.txt")
        .await
        .unwrap();
    let root = journal.file_record(".").await.unwrap().unwrap();
    assert_eq!(root.etag, INVALID_ETAG);
}

#[test]
fn parent_dir_of_splits_paths() {
    assert_eq!(parent_dir_of("Docs/A.txt"), "Docs");
    assert_eq!(parent_dir_of("a/b/c.txt"), "a/b");
    assert_eq!(parent_dir_of("top.txt"), ".");
    assert_eq!(parent_dir_of("/rooted.txt"), "/");
}
