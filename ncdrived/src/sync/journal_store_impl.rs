impl SyncJournal {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, JournalError> {
        let pool = SqlitePool::connect(database_url).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn new_default() -> Result<Self, JournalError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let journal = Self { pool };
        journal.init().await?;
        Ok(journal)
    }

    pub async fn init(&self) -> Result<(), JournalError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Every statement is committed as it executes; the tag keeps the
    /// historical commit points visible in the logs.
    pub fn commit(&self, tag: &str) {
        debug!(tag, "journal commit");
    }

    pub async fn upload_info(&self, path: &str) -> Result<UploadInfo, JournalError> {
        let row = sqlx::query(
            "SELECT chunk, transfer_id, modtime, error_count, content_checksum, size
             FROM upload_info WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(UploadInfo::default());
        };

        Ok(UploadInfo {
            valid: true,
            chunk: row.try_get("chunk")?,
            transfer_id: row.try_get("transfer_id")?,
            modtime: row.try_get("modtime")?,
            error_count: row.try_get("error_count")?,
            content_checksum: row.try_get("content_checksum")?,
            size: row.try_get("size")?,
        })
    }

    pub async fn set_upload_info(&self, path: &str, info: &UploadInfo) -> Result<(), JournalError> {
        if !info.valid {
            sqlx::query("DELETE FROM upload_info WHERE path = ?1")
                .bind(path)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO upload_info (path, chunk, transfer_id, modtime, error_count, content_checksum, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(path) DO UPDATE SET
                 chunk = excluded.chunk,
                 transfer_id = excluded.transfer_id,
                 modtime = excluded.modtime,
                 error_count = excluded.error_count,
                 content_checksum = excluded.content_checksum,
                 size = excluded.size",
        )
        .bind(path)
        .bind(info.chunk)
        .bind(info.transfer_id)
        .bind(info.modtime)
        .bind(info.error_count)
        .bind(&info.content_checksum)
        .bind(info.size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_poll_info(&self, info: &PollInfo) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO poll_info (path, url, modtime, file_size)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
                 url = excluded.url,
                 modtime = excluded.modtime,
                 file_size = excluded.file_size",
        )
        .bind(&info.file)
        .bind(&info.url)
        .bind(info.modtime)
        .bind(info.file_size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn poll_info(&self, path: &str) -> Result<Option<PollInfo>, JournalError> {
        let row = sqlx::query("SELECT path, url, modtime, file_size FROM poll_info WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PollInfo {
            file: row.try_get("path")?,
            url: row.try_get("url")?,
            modtime: row.try_get("modtime")?,
            file_size: row.try_get("file_size")?,
        }))
    }

    pub async fn poll_infos(&self) -> Result<Vec<PollInfo>, JournalError> {
        let rows =
            sqlx::query("SELECT path, url, modtime, file_size FROM poll_info ORDER BY path ASC")
                .fetch_all(&self.pool)
                .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PollInfo {
                file: row.try_get("path")?,
                url: row.try_get("url")?,
                modtime: row.try_get("modtime")?,
                file_size: row.try_get("file_size")?,
            });
        }
        Ok(out)
    }

    pub async fn remove_poll_info(&self, path: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM poll_info WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn conflict_record(&self, path: &str) -> Result<Option<ConflictRecord>, JournalError> {
        let row = sqlx::query(
            "SELECT initial_base_path, base_file_id, base_modtime, base_etag
             FROM conflicts WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ConflictRecord {
            initial_base_path: row.try_get("initial_base_path")?,
            base_file_id: row.try_get("base_file_id")?,
            base_modtime: row.try_get("base_modtime")?,
            base_etag: row.try_get("base_etag")?,
        }))
    }

    pub async fn set_conflict_record(
        &self,
        path: &str,
        record: &ConflictRecord,
    ) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO conflicts (path, initial_base_path, base_file_id, base_modtime, base_etag)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                 initial_base_path = excluded.initial_base_path,
                 base_file_id = excluded.base_file_id,
                 base_modtime = excluded.base_modtime,
                 base_etag = excluded.base_etag",
        )
        .bind(path)
        .bind(&record.initial_base_path)
        .bind(&record.base_file_id)
        .bind(record.base_modtime)
        .bind(&record.base_etag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn error_blacklist_entry(
        &self,
        path: &str,
    ) -> Result<Option<BlacklistEntry>, JournalError> {
        let row = sqlx::query(
            "SELECT error_string, http_error_code, retry_count, last_try_modtime, last_try_time
             FROM error_blacklist WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let http_error_code: i64 = row.try_get("http_error_code")?;
        Ok(Some(BlacklistEntry {
            error_string: row.try_get("error_string")?,
            http_error_code: http_error_code as u16,
            retry_count: row.try_get("retry_count")?,
            last_try_modtime: row.try_get("last_try_modtime")?,
            last_try_time: row.try_get("last_try_time")?,
        }))
    }

    pub async fn set_error_blacklist_entry(
        &self,
        path: &str,
        entry: &BlacklistEntry,
    ) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO error_blacklist (path, error_string, http_error_code, retry_count, last_try_modtime, last_try_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                 error_string = excluded.error_string,
                 http_error_code = excluded.http_error_code,
                 retry_count = excluded.retry_count,
                 last_try_modtime = excluded.last_try_modtime,
                 last_try_time = excluded.last_try_time",
        )
        .bind(path)
        .bind(&entry.error_string)
        .bind(entry.http_error_code as i64)
        .bind(entry.retry_count)
        .bind(entry.last_try_modtime)
        .bind(entry.last_try_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn wipe_error_blacklist_entry(&self, path: &str) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM error_blacklist WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_file_record(&self, record: &FileRecord) -> Result<(), JournalError> {
        sqlx::query(
            "INSERT INTO items (path, etag, file_id, modtime, size, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                 etag = excluded.etag,
                 file_id = excluded.file_id,
                 modtime = excluded.modtime,
                 size = excluded.size,
                 checksum = excluded.checksum",
        )
        .bind(&record.path)
        .bind(&record.etag)
        .bind(&record.file_id)
        .bind(record.modtime)
        .bind(record.size)
        .bind(&record.checksum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn file_record(&self, path: &str) -> Result<Option<FileRecord>, JournalError> {
        let row = sqlx::query(
            "SELECT path, etag, file_id, modtime, size, checksum FROM items WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(FileRecord {
            path: row.try_get("path")?,
            etag: row.try_get("etag")?,
            file_id: row.try_get("file_id")?,
            modtime: row.try_get("modtime")?,
            size: row.try_get("size")?,
            checksum: row.try_get("checksum")?,
        }))
    }

    /// Poisons the stored etag of the file's parent directory so the next
    /// sync run re-lists it remotely instead of trusting the database.
    pub async fn schedule_path_for_remote_discovery(&self, path: &str) -> Result<(), JournalError> {
        let parent = parent_dir_of(path);
        sqlx::query(
            "INSERT INTO items (path, etag) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET etag = excluded.etag",
        )
        .bind(parent)
        .bind(INVALID_ETAG)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
