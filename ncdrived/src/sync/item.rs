use std::path::PathBuf;

/// Terminal (or not-yet-terminal) state of one sync work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    NoStatus,
    Success,
    Conflict,
    Restoration,
    /// Transient; the next sync run retries the file.
    SoftError,
    /// Reported to the user and counted against the error blacklist.
    NormalError,
    /// Stops all remaining propagation.
    FatalError,
    /// Reported with extra detail, e.g. a quota refusal.
    DetailError,
    FileIgnored,
    BlacklistedError,
    FileLocked,
    FileNameInvalid,
}

impl ItemStatus {
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            ItemStatus::NoStatus | ItemStatus::Success | ItemStatus::Restoration
        )
    }
}

/// Discovery's intent for the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    New,
    TypeChange,
    UpdateMetadata,
    Sync,
}

/// One locally-changed file on its way to the server. Borrowed mutably for
/// the lifetime of an upload attempt; `file` stays the logical sync path even
/// when a rename redirects the uploaded body.
#[derive(Debug, Clone)]
pub struct SyncFileItem {
    pub file: String,
    pub rename_target: Option<String>,
    pub original_file: String,
    pub size: i64,
    pub modtime: i64,
    pub etag: String,
    pub file_id: String,
    /// `"TYPE:hex"`, reflecting a digest actually computed over the bytes
    /// that will be (or were) uploaded.
    pub checksum_header: String,
    pub status: ItemStatus,
    pub error_string: String,
    pub http_error_code: u16,
    pub instruction: Instruction,
    pub has_blacklist_entry: bool,
    pub is_restoration: bool,
    pub response_time_stamp: i64,
    pub request_id: String,
}

impl SyncFileItem {
    pub fn new(file: impl Into<String>, size: i64, modtime: i64, instruction: Instruction) -> Self {
        let file = file.into();
        Self {
            original_file: file.clone(),
            file,
            rename_target: None,
            size,
            modtime,
            etag: String::new(),
            file_id: String::new(),
            checksum_header: String::new(),
            status: ItemStatus::NoStatus,
            error_string: String::new(),
            http_error_code: 0,
            instruction,
            has_blacklist_entry: false,
            is_restoration: false,
            response_time_stamp: 0,
            request_id: String::new(),
        }
    }

    pub fn destination(&self) -> &str {
        self.rename_target.as_deref().unwrap_or(&self.file)
    }
}

/// The file that actually goes over the wire: possibly a renamed sibling of
/// the logical `SyncFileItem::file`.
#[derive(Debug, Clone)]
pub struct UploadFileInfo {
    pub rel_file: String,
    pub abs_local_path: PathBuf,
    pub size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_keeps_original_file() {
        let item = SyncFileItem::new("Docs/A.txt", 10, 1000, Instruction::New);
        assert_eq!(item.original_file, "Docs/A.txt");
        assert_eq!(item.status, ItemStatus::NoStatus);
        assert_eq!(item.destination(), "Docs/A.txt");
    }

    #[test]
    fn destination_prefers_rename_target() {
        let mut item = SyncFileItem::new("Docs/A.txt ", 10, 1000, Instruction::New);
        item.rename_target = Some("Docs/A.txt".to_string());
        assert_eq!(item.destination(), "Docs/A.txt");
    }

    #[test]
    fn error_classification() {
        assert!(ItemStatus::NormalError.is_error());
        assert!(ItemStatus::DetailError.is_error());
        assert!(!ItemStatus::Success.is_error());
        assert!(!ItemStatus::Restoration.is_error());
    }
}
