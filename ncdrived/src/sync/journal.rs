use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Progress record of an upload in flight, written before the request goes
/// out so a lost reply can be reconciled after a crash. An absent row reads
/// back as `valid = false`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadInfo {
    pub valid: bool,
    pub chunk: i64,
    pub transfer_id: i64,
    pub modtime: i64,
    pub error_count: i64,
    pub content_checksum: String,
    pub size: i64,
}

/// Deferred-processing poll registered for a file after a 202 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollInfo {
    pub file: String,
    pub url: String,
    pub modtime: i64,
    pub file_size: i64,
}

/// Base version of a file involved in a conflict upload; emitted as
/// `OC-Conflict*` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub initial_base_path: String,
    pub base_file_id: String,
    pub base_modtime: i64,
    pub base_etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub error_string: String,
    pub http_error_code: u16,
    pub retry_count: i64,
    pub last_try_modtime: i64,
    pub last_try_time: i64,
}

/// Server-side metadata of a synced file, committed once an upload reaches
/// the metadata stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub etag: String,
    pub file_id: String,
    pub modtime: i64,
    pub size: i64,
    pub checksum: String,
}

/// Etag sentinel poisoning a directory record so the next discovery re-lists
/// it remotely.
pub const INVALID_ETAG: &str = "_invalid_";

#[derive(Clone)]
pub struct SyncJournal {
    pool: SqlitePool,
}

include!("journal_store_impl.rs");

fn default_db_path() -> Result<PathBuf, JournalError> {
    let mut path = dirs::data_dir().ok_or(JournalError::MissingDataDir)?;
    path.push("ncdrive");
    path.push("sync");
    path.push("journal.db");
    Ok(path)
}

fn parent_dir_of(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        Some(_) => "/",
        None => ".",
    }
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
