//! Offline restore of a completed backup into a fresh database directory.

use std::path::Path;

use tracing::info;

use crate::io;
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::types::{BackupError, Result};

/// Rebuilds a database directory from `backup_dir` into `target_dir`.
///
/// `backup_dir` must hold a readable manifest (the completeness signal);
/// `target_dir` must not exist, or must be an empty directory. The data
/// file is restored under its original basename, recovered from the
/// manifest, with the WAL beside it when one was captured. No live
/// database is required.
pub fn restore_from_backup(
    backup_dir: impl AsRef<Path>,
    target_dir: impl AsRef<Path>,
) -> Result<()> {
    let backup = backup_dir.as_ref();
    let target = target_dir.as_ref();

    if !io::exists(backup) {
        return Err(BackupError::BackupNotFound(backup.to_path_buf()));
    }
    let manifest_path = backup.join(MANIFEST_FILE_NAME);
    if !io::exists(&manifest_path) {
        return Err(BackupError::BackupNotFound(backup.to_path_buf()));
    }
    let manifest = Manifest::read_from(&manifest_path)?;

    if io::exists(target) && (!target.is_dir() || !io::dir_is_empty(target)?) {
        return Err(BackupError::TargetExists(target.to_path_buf()));
    }
    io::create_dir_all(target)?;

    let basename = Path::new(&manifest.db_path)
        .file_name()
        .ok_or(BackupError::ManifestCorrupt(
            "manifest database path has no file name",
        ))?;
    let backup_data = backup.join(basename);
    if !io::exists(&backup_data) {
        return Err(BackupError::MissingFile(backup_data));
    }
    let target_data = target.join(basename);
    io::copy_file(&backup_data, &target_data)?;

    let mut wal_name = basename.to_os_string();
    wal_name.push(".wal");
    let backup_wal = backup.join(&wal_name);
    if io::exists(&backup_wal) {
        io::copy_file(&backup_wal, target.join(&wal_name))?;
    }

    let expected = manifest.size_bytes;
    let found = io::file_size(&target_data)?;
    if found != expected {
        return Err(BackupError::SizeMismatch { expected, found });
    }

    info!(
        pages = manifest.page_count,
        snapshot_ts = manifest.snapshot_ts,
        target = %target.display(),
        "restore.completed"
    );
    Ok(())
}
