use std::path::Path;

use crate::sync::item::SyncFileItem;

/// Whether a file should be materialized locally or live server-side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    AlwaysLocal,
    Inherited,
    OnlineOnly,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertToPlaceholderResult {
    Ok,
    Locked,
}

/// Placeholder manager of the virtual filesystem. The propagator only needs
/// pin-state queries and the placeholder conversion that follows a metadata
/// commit.
pub trait Vfs: Send + Sync {
    fn pin_state(&self, file: &str) -> Option<PinState>;

    /// Returns false when the pin state could not be changed.
    fn set_pin_state(&self, file: &str, state: PinState) -> bool;

    fn convert_to_placeholder(
        &self,
        item: &SyncFileItem,
        local_path: &Path,
    ) -> Result<ConvertToPlaceholderResult, String>;
}

/// No placeholders: every file is a plain file on disk.
pub struct VfsOff;

impl Vfs for VfsOff {
    fn pin_state(&self, _file: &str) -> Option<PinState> {
        None
    }

    fn set_pin_state(&self, _file: &str, _state: PinState) -> bool {
        true
    }

    fn convert_to_placeholder(
        &self,
        _item: &SyncFileItem,
        _local_path: &Path,
    ) -> Result<ConvertToPlaceholderResult, String> {
        Ok(ConvertToPlaceholderResult::Ok)
    }
}
