//! WAL and auxiliary file capture: stages two and three of the backup
//! worker.
//!
//! The whole WAL file is copied rather than filtered by commit timestamp;
//! restore replays only records up to the snapshot point, so extra trailing
//! records are harmless.

use std::path::Path;

use tracing::debug;

use crate::host::HostInfo;
use crate::io;
use crate::types::{BackupError, Result};

/// Copies the host's WAL into the backup directory under its own basename.
/// A missing or empty WAL is a success; `Ok(None)` reports that nothing was
/// captured.
pub(crate) fn capture_wal(wal_src: &Path, backup_dir: &Path) -> Result<Option<u64>> {
    if !io::exists(wal_src) {
        debug!("backup.wal.absent");
        return Ok(None);
    }
    if io::file_size(wal_src)? == 0 {
        debug!("backup.wal.empty");
        return Ok(None);
    }
    let name = wal_src
        .file_name()
        .ok_or_else(|| BackupError::InvalidPath(wal_src.display().to_string()))?;
    let copied = io::copy_file(wal_src, backup_dir.join(name))?;
    debug!(bytes = copied, "backup.wal.captured");
    Ok(Some(copied))
}

/// Copies auxiliary metadata files that live beside the data file. Only the
/// lock file today; absent or empty files are skipped.
pub(crate) fn capture_aux_files(host: &HostInfo, backup_dir: &Path) -> Result<()> {
    let lock = host.lock_path();
    if io::exists(&lock) && io::file_size(&lock)? > 0 {
        if let Some(name) = lock.file_name() {
            let copied = io::copy_file(&lock, backup_dir.join(name))?;
            debug!(bytes = copied, "backup.aux.lock_captured");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileIo, StdFileIo};
    use tempfile::tempdir;

    #[test]
    fn missing_wal_is_skipped() -> Result<()> {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b");
        io::create_dir_all(&backup)?;
        assert_eq!(capture_wal(&dir.path().join("graph.db.wal"), &backup)?, None);
        Ok(())
    }

    #[test]
    fn empty_wal_is_skipped() -> Result<()> {
        let dir = tempdir().unwrap();
        let wal = dir.path().join("graph.db.wal");
        StdFileIo::create(&wal)?;
        let backup = dir.path().join("b");
        io::create_dir_all(&backup)?;
        assert_eq!(capture_wal(&wal, &backup)?, None);
        assert!(!io::exists(backup.join("graph.db.wal")));
        Ok(())
    }

    #[test]
    fn wal_bytes_copied_verbatim() -> Result<()> {
        let dir = tempdir().unwrap();
        let wal = dir.path().join("graph.db.wal");
        let file = StdFileIo::create(&wal)?;
        file.write_at(0, b"wal-frame-0;wal-frame-1")?;
        let backup = dir.path().join("b");
        io::create_dir_all(&backup)?;

        assert_eq!(capture_wal(&wal, &backup)?, Some(23));
        let copy = StdFileIo::open_read(backup.join("graph.db.wal"))?;
        let mut buf = vec![0u8; 23];
        copy.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"wal-frame-0;wal-frame-1");
        Ok(())
    }

    #[test]
    fn lock_file_copied_when_present() -> Result<()> {
        let dir = tempdir().unwrap();
        let host = HostInfo {
            db_id: "db".into(),
            db_path: dir.path().join("graph.db"),
            engine_version: "0.1.0".into(),
        };
        let lock = StdFileIo::create(host.lock_path())?;
        lock.write_at(0, b"pid=1")?;
        let backup = dir.path().join("b");
        io::create_dir_all(&backup)?;

        capture_aux_files(&host, &backup)?;
        assert!(io::exists(backup.join("graph.db.lock")));

        // Absent lock file: nothing to do, nothing copied.
        let other = HostInfo {
            db_path: dir.path().join("other.db"),
            ..host
        };
        capture_aux_files(&other, &backup)?;
        assert!(!io::exists(backup.join("other.db.lock")));
        Ok(())
    }
}
