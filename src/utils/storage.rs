// pgbackup/src/utils/storage.rs
use std::fs;
use std::io;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Kilobytes per megabyte, as used by the space thresholds.
pub const KB_PER_MB: u64 = 1024;

/// Source of free-space figures for the gates in the backup run.
pub trait StorageProbe {
    /// Available kilobytes on the filesystem containing `path`. Zero when unknown.
    fn free_space_kb(&self, path: &Path) -> u64;
}

/// Reads filesystem statistics of the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl StorageProbe for FsProbe {
    fn free_space_kb(&self, path: &Path) -> u64 {
        match fs2::available_space(path) {
            Ok(bytes) => bytes / 1024,
            Err(e) => {
                warn!("Could not query free space for {}: {}", path.display(), e);
                0
            }
        }
    }
}

/// Creates the backup directory if needed and proves it accepts new files.
pub fn ensure_backup_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    if !path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} is not a directory", path.display()),
        ));
    }
    // Dropped straight away; removal is handled by NamedTempFile.
    let probe = NamedTempFile::new_in(path)?;
    debug!("Write probe {} succeeded", probe.path().display());
    Ok(())
}

/// Best-effort removal; the primary error has already been reported by the caller.
pub fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_probe_reports_space_for_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsProbe.free_space_kb(dir.path()) > 0);
    }

    #[test]
    fn test_fs_probe_returns_zero_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does/not/exist");
        assert_eq!(FsProbe.free_space_kb(&missing), 0);
    }

    #[test]
    fn test_ensure_backup_dir_creates_nested_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nightly/pg");
        ensure_backup_dir(&target).unwrap();
        ensure_backup_dir(&target).unwrap();
        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn test_ensure_backup_dir_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        assert!(ensure_backup_dir(&file).is_err());
    }

    #[test]
    fn test_remove_quietly_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("raw.sql");
        fs::write(&file, b"--").unwrap();
        remove_quietly(&file);
        remove_quietly(&file);
        assert!(!file.exists());
    }
}
