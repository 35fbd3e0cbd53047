//! Integrity checks run before a backup is declared complete.

use std::ffi::OsStr;
use std::path::Path;

use crc32fast::Hasher;
use tracing::debug;

use crate::io::{self, FileIo, StdFileIo};
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::types::{BackupError, Result};

const CRC_CHUNK_BYTES: usize = 64 * 1024;

/// Confirms a freshly written backup directory is self-consistent:
///
/// 1. the manifest exists and deserializes,
/// 2. the data file exists with length `page_count * page_size`,
/// 3. the re-read manifest agrees with what the worker wrote,
/// 4. a captured WAL is present and readable,
/// 5. the data file checksum matches the manifest's, when recorded.
pub(crate) fn verify_backup(
    backup_dir: &Path,
    written: &Manifest,
    data_name: &OsStr,
    page_size: u64,
    wal_captured: bool,
) -> Result<()> {
    let manifest_path = backup_dir.join(MANIFEST_FILE_NAME);
    if !io::exists(&manifest_path) {
        return Err(BackupError::MissingFile(manifest_path));
    }
    let reread = Manifest::read_from(&manifest_path)?;
    if reread.page_count != written.page_count {
        return Err(BackupError::ManifestCorrupt(
            "manifest page count does not match pages written",
        ));
    }

    let data_path = backup_dir.join(data_name);
    if !io::exists(&data_path) {
        return Err(BackupError::MissingFile(data_path));
    }
    let expected = written.page_count * page_size;
    let found = io::file_size(&data_path)?;
    if found != expected {
        return Err(BackupError::SizeMismatch { expected, found });
    }

    if wal_captured {
        let wal_path = backup_dir.join(wal_name(data_name));
        let wal = StdFileIo::open_read(&wal_path)
            .map_err(|_| BackupError::MissingFile(wal_path.clone()))?;
        if wal.is_empty()? {
            return Err(BackupError::Corruption("captured wal file is empty"));
        }
    }

    if let Some(expected_crc) = written.data_crc32 {
        let actual = file_crc32(&data_path)?;
        if actual != expected_crc {
            return Err(BackupError::Corruption("backup data file checksum mismatch"));
        }
    }

    debug!(pages = written.page_count, "backup.verify.passed");
    Ok(())
}

fn wal_name(data_name: &OsStr) -> std::ffi::OsString {
    let mut name = data_name.to_os_string();
    name.push(".wal");
    name
}

fn file_crc32(path: &Path) -> Result<u32> {
    let file = StdFileIo::open_read(path)?;
    let total = file.len()?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; CRC_CHUNK_BYTES];
    let mut off = 0u64;
    while off < total {
        let chunk = (total - off).min(CRC_CHUNK_BYTES as u64) as usize;
        file.read_at(off, &mut buf[..chunk])?;
        hasher.update(&buf[..chunk]);
        off += chunk as u64;
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use tempfile::tempdir;

    const PAGE: u64 = 256;

    fn write_backup(dir: &Path, pages: &[Vec<u8>], with_wal: bool) -> Result<Manifest> {
        io::create_dir_all(dir)?;
        let data = StdFileIo::create(dir.join("graph.db"))?;
        let mut hasher = Hasher::new();
        for (i, page) in pages.iter().enumerate() {
            data.write_at(i as u64 * PAGE, page)?;
            hasher.update(page);
        }
        data.sync_all()?;
        if with_wal {
            let wal = StdFileIo::create(dir.join("graph.db.wal"))?;
            wal.write_at(0, b"records")?;
        }
        let manifest = Manifest {
            snapshot_ts: 7,
            db_id: "db".into(),
            db_path: "/data/graph.db".into(),
            backup_ts: 0,
            page_count: pages.len() as u64,
            size_bytes: pages.len() as u64 * PAGE,
            engine_version: "0.1.0".into(),
            data_crc32: Some(hasher.finalize()),
        };
        manifest.write_to(dir.join(MANIFEST_FILE_NAME))?;
        Ok(manifest)
    }

    fn data_name() -> OsString {
        OsString::from("graph.db")
    }

    #[test]
    fn well_formed_backup_passes() -> Result<()> {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b");
        let manifest = write_backup(&backup, &[vec![1; PAGE as usize]], true)?;
        verify_backup(&backup, &manifest, &data_name(), PAGE, true)
    }

    #[test]
    fn missing_manifest_fails() -> Result<()> {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b");
        let manifest = write_backup(&backup, &[], false)?;
        io::remove_file(backup.join(MANIFEST_FILE_NAME))?;
        assert!(matches!(
            verify_backup(&backup, &manifest, &data_name(), PAGE, false),
            Err(BackupError::MissingFile(_))
        ));
        Ok(())
    }

    #[test]
    fn short_data_file_fails_with_size_mismatch() -> Result<()> {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b");
        let mut manifest = write_backup(&backup, &[vec![3; PAGE as usize]], false)?;
        manifest.page_count = 2;
        manifest.size_bytes = 2 * PAGE;
        manifest.write_to(backup.join(MANIFEST_FILE_NAME))?;
        assert!(matches!(
            verify_backup(&backup, &manifest, &data_name(), PAGE, false),
            Err(BackupError::SizeMismatch {
                expected,
                found,
            }) if expected == 2 * PAGE && found == PAGE
        ));
        Ok(())
    }

    #[test]
    fn tampered_data_file_fails_checksum() -> Result<()> {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b");
        let manifest = write_backup(&backup, &[vec![5; PAGE as usize]], false)?;
        let data = StdFileIo::open_rw(backup.join("graph.db"))?;
        data.write_at(17, &[0xEE])?;
        assert!(matches!(
            verify_backup(&backup, &manifest, &data_name(), PAGE, false),
            Err(BackupError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn missing_captured_wal_fails() -> Result<()> {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b");
        let manifest = write_backup(&backup, &[vec![5; PAGE as usize]], false)?;
        assert!(matches!(
            verify_backup(&backup, &manifest, &data_name(), PAGE, true),
            Err(BackupError::MissingFile(_))
        ));
        Ok(())
    }

    #[test]
    fn empty_backup_passes_trivially() -> Result<()> {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b");
        let manifest = write_backup(&backup, &[], false)?;
        verify_backup(&backup, &manifest, &data_name(), PAGE, false)
    }
}
