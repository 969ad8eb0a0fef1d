use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn get_modtime(path: &Path) -> io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0))
}

pub fn get_size(path: &Path) -> io::Result<i64> {
    Ok(std::fs::metadata(path)?.len() as i64)
}

pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

pub fn rename(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::rename(from, to)
}

/// Whether the file still has the size and mtime recorded before the upload.
/// An unreadable file counts as changed.
pub fn verify_file_unchanged(path: &Path, previous_size: i64, previous_modtime: i64) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let modtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    metadata.len() as i64 == previous_size && modtime == previous_modtime
}

/// Best-effort "locked by another process" signal. Sharing violations are a
/// Windows concept; elsewhere the only usable hint is an open that fails on a
/// file that demonstrably exists.
pub fn is_file_locked(path: &Path) -> bool {
    match std::fs::OpenOptions::new().read(true).open(path) {
        Ok(_) => false,
        Err(err) => {
            path.exists()
                && matches!(
                    err.kind(),
                    ErrorKind::PermissionDenied | ErrorKind::WouldBlock
                )
        }
    }
}

/// Whether a sibling exists that differs from `rel_file`'s name only in
/// case. Such a pair is ambiguous on case-insensitive filesystems and the
/// server refuses it.
pub fn has_case_clash(root: &Path, rel_file: &str) -> io::Result<bool> {
    let abs = root.join(rel_file);
    let Some(name) = abs.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };
    let Some(parent) = abs.parent() else {
        return Ok(false);
    };
    let folded = name.to_lowercase();
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let other = entry.file_name();
        let Some(other) = other.to_str() else {
            continue;
        };
        if other != name && other.to_lowercase() == folded {
            return Ok(true);
        }
    }
    Ok(false)
}

/// We do not want to upload files that are currently being modified, so a
/// file whose mtime is too close to "now" is skipped. An mtime far enough in
/// the future is accepted: the delay will never elapse for such clocks.
pub fn file_is_still_changing(modtime: i64, minimum_file_age: Duration) -> bool {
    let ms_since_mod = (now_unix() - modtime).saturating_mul(1000);
    ms_since_mod < minimum_file_age.as_millis() as i64 && ms_since_mod > -10_000
}

/// Quota bookkeeping key: the parent directory of a relative path, "." for
/// top-level files.
pub fn parent_dir(rel_file: &str) -> String {
    match rel_file.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        Some(_) => "/".to_string(),
        None => ".".to_string(),
    }
}

pub fn octets_to_string(octets: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let value = octets.max(0) as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{octets} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn set_mtime(path: &Path, unix_secs: i64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(unix_secs as u64))
            .unwrap();
    }

    #[test]
    fn detects_case_clashing_sibling() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), b"a").unwrap();
        std::fs::write(dir.path().join("readme.md"), b"b").unwrap();
        std::fs::write(dir.path().join("other.md"), b"c").unwrap();

        assert!(has_case_clash(dir.path(), "README.md").unwrap());
        assert!(has_case_clash(dir.path(), "readme.md").unwrap());
        assert!(!has_case_clash(dir.path(), "other.md").unwrap());
    }

    #[test]
    fn fresh_files_are_still_changing() {
        let now = now_unix();
        assert!(file_is_still_changing(now, Duration::from_secs(2)));
        assert!(!file_is_still_changing(now - 10, Duration::from_secs(2)));
    }

    #[test]
    fn far_future_mtimes_are_accepted() {
        let now = now_unix();
        // Within ten seconds in the future: still changing.
        assert!(file_is_still_changing(now + 5, Duration::from_secs(2)));
        // Beyond ten seconds: upload anyway.
        assert!(!file_is_still_changing(now + 60, Duration::from_secs(2)));
    }

    #[test]
    fn verify_file_unchanged_checks_size_and_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"12345").unwrap();
        set_mtime(&path, 1_700_000_000);

        assert!(verify_file_unchanged(&path, 5, 1_700_000_000));
        assert!(!verify_file_unchanged(&path, 6, 1_700_000_000));
        assert!(!verify_file_unchanged(&path, 5, 1_700_000_001));
        assert!(!verify_file_unchanged(&dir.path().join("gone.txt"), 5, 0));
    }

    #[test]
    fn regular_files_are_not_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();
        assert!(!is_file_locked(&path));
        assert!(!is_file_locked(&dir.path().join("missing.txt")));
    }

    #[test]
    fn parent_dir_defaults_to_dot() {
        assert_eq!(parent_dir("a.txt"), ".");
        assert_eq!(parent_dir("Docs/a.txt"), "Docs");
        assert_eq!(parent_dir("a/b/c.txt"), "a/b");
    }

    #[test]
    fn octets_format_scales() {
        assert_eq!(octets_to_string(100), "100 B");
        assert_eq!(octets_to_string(10 * 1024 * 1024), "10.0 MB");
        assert!(octets_to_string(3 * 1024 * 1024 * 1024).contains("GB"));
    }
}
