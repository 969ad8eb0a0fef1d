use tracing::info;

use crate::sync::filesystem::now_unix;
use crate::sync::item::{ItemStatus, SyncFileItem};
use crate::sync::journal::{BlacklistEntry, JournalError, SyncJournal};

/// Updates the error blacklist for a failed item. A failure that keeps
/// recurring for a file the blacklist already knew about is reclassified as
/// `BlacklistedError` so the UI can de-emphasize it.
pub async fn blacklist_update(
    journal: &SyncJournal,
    item: &mut SyncFileItem,
) -> Result<(), JournalError> {
    let old_entry = journal.error_blacklist_entry(&item.file).await?;

    let may_blacklist = matches!(
        item.status,
        ItemStatus::NormalError | ItemStatus::DetailError
    ) && item.http_error_code != 0;

    if !may_blacklist {
        if old_entry.is_some() {
            journal.wipe_error_blacklist_entry(&item.file).await?;
        }
        return Ok(());
    }

    let retry_count = old_entry.map(|entry| entry.retry_count + 1).unwrap_or(1);
    let entry = BlacklistEntry {
        error_string: item.error_string.clone(),
        http_error_code: item.http_error_code,
        retry_count,
        last_try_modtime: item.modtime,
        last_try_time: now_unix(),
    };
    journal.set_error_blacklist_entry(&item.file, &entry).await?;
    info!(
        file = %item.file,
        retry_count,
        http_error_code = item.http_error_code,
        "blacklist entry updated"
    );

    if item.has_blacklist_entry {
        item.status = ItemStatus::BlacklistedError;
    }
    Ok(())
}

/// A successful upload clears blacklist entries for the logical path and,
/// after a move, for the pre-move path as well.
pub async fn wipe_on_success(
    journal: &SyncJournal,
    item: &SyncFileItem,
) -> Result<(), JournalError> {
    journal.wipe_error_blacklist_entry(&item.file).await?;
    if item.original_file != item.file {
        journal
            .wipe_error_blacklist_entry(&item.original_file)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::item::Instruction;
    use sqlx::SqlitePool;

    async fn make_journal() -> SyncJournal {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let journal = SyncJournal::from_pool(pool);
        journal.init().await.unwrap();
        journal
    }

    fn failed_item(status: ItemStatus, code: u16) -> SyncFileItem {
        let mut item = SyncFileItem::new("Docs/A.txt", 5, 1000, Instruction::New);
        item.status = status;
        item.http_error_code = code;
        item.error_string = "upload failed".to_string();
        item
    }

    #[tokio::test]
    async fn repeated_errors_grow_the_retry_count() {
        let journal = make_journal().await;
        let mut item = failed_item(ItemStatus::NormalError, 500);

        blacklist_update(&journal, &mut item).await.unwrap();
        blacklist_update(&journal, &mut item).await.unwrap();

        let entry = journal
            .error_blacklist_entry("Docs/A.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.http_error_code, 500);
    }

    #[tokio::test]
    async fn known_blacklisted_items_are_reclassified() {
        let journal = make_journal().await;
        let mut item = failed_item(ItemStatus::NormalError, 500);
        item.has_blacklist_entry = true;

        blacklist_update(&journal, &mut item).await.unwrap();
        assert_eq!(item.status, ItemStatus::BlacklistedError);
    }

    #[tokio::test]
    async fn soft_errors_do_not_blacklist_and_clear_stale_entries() {
        let journal = make_journal().await;

        let mut failing = failed_item(ItemStatus::NormalError, 500);
        blacklist_update(&journal, &mut failing).await.unwrap();
        assert!(
            journal
                .error_blacklist_entry("Docs/A.txt")
                .await
                .unwrap()
                .is_some()
        );

        let mut soft = failed_item(ItemStatus::SoftError, 0);
        blacklist_update(&journal, &mut soft).await.unwrap();
        assert!(
            journal
                .error_blacklist_entry("Docs/A.txt")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(soft.status, ItemStatus::SoftError);
    }

    #[tokio::test]
    async fn success_wipes_both_paths_after_a_move() {
        let journal = make_journal().await;
        let entry = BlacklistEntry {
            error_string: String::new(),
            http_error_code: 500,
            retry_count: 1,
            last_try_modtime: 0,
            last_try_time: 0,
        };
        journal
            .set_error_blacklist_entry("Docs/New.txt", &entry)
            .await
            .unwrap();
        journal
            .set_error_blacklist_entry("Docs/Old.txt", &entry)
            .await
            .unwrap();

        let mut item = SyncFileItem::new("Docs/New.txt", 5, 1000, Instruction::New);
        item.original_file = "Docs/Old.txt".to_string();
        wipe_on_success(&journal, &item).await.unwrap();

        assert!(
            journal
                .error_blacklist_entry("Docs/New.txt")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            journal
                .error_blacklist_entry("Docs/Old.txt")
                .await
                .unwrap()
                .is_none()
        );
    }
}
