//! Contracts the host database fulfils for the backup core.
//!
//! The backup core never owns the database. It borrows three narrow
//! capabilities: a logical clock for the snapshot timestamp, read access to
//! the live paged data file, and a hook point on the page-write path. The
//! hook runs in the opposite direction (host calls core), which is why it is
//! a trait the coordinator implements rather than a callback it stores.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::io::{FileIo, StdFileIo};
use crate::types::{BackupError, PageId, Result};

/// Logical timestamp authority, normally the host's transaction manager.
///
/// Values must be monotonically non-decreasing; the value observed at
/// `start_backup` becomes the snapshot timestamp the backup represents.
/// Wall-clock time is not a valid implementation.
pub trait TimestampSource: Send + Sync + 'static {
    fn current_snapshot_timestamp(&self) -> u64;
}

/// Read access to the live paged data file.
///
/// Implementations must be safe for concurrent readers; the backup worker
/// and the host's own readers share this handle.
pub trait DataSource: Send + Sync + 'static {
    /// Fixed page size in bytes, a power of two.
    fn page_size(&self) -> u64;

    /// Current page count of the data file.
    fn num_pages(&self) -> Result<u64>;

    /// Reads page `page` into `dst`, which must be exactly one page long.
    fn read_page(&self, page: PageId, dst: &mut [u8]) -> Result<()>;
}

/// Hook invoked by the host's page-write path before any byte of a page is
/// mutated. Implemented by the backup coordinator; the host installs it at
/// construction and drops it when the coordinator goes away.
pub trait PageWriteObserver: Send + Sync + 'static {
    fn before_page_write(&self, page: PageId);
}

/// Identity of the database being backed up.
#[derive(Clone, Debug)]
pub struct HostInfo {
    /// Opaque database identifier.
    pub db_id: String,
    /// Path of the live paged data file.
    pub db_path: PathBuf,
    /// Engine version string recorded in the manifest.
    pub engine_version: String,
}

impl HostInfo {
    /// File name of the data file; the backup copy keeps the same name.
    pub(crate) fn db_basename(&self) -> Result<OsString> {
        self.db_path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| BackupError::InvalidPath(self.db_path.display().to_string()))
    }

    /// The WAL lives beside the data file as `<db_basename>.wal`.
    pub(crate) fn wal_path(&self) -> PathBuf {
        append_extension(&self.db_path, ".wal")
    }

    /// Lock file beside the data file, copied into the backup if present.
    pub(crate) fn lock_path(&self) -> PathBuf {
        append_extension(&self.db_path, ".lock")
    }
}

pub(crate) fn append_extension(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// `DataSource` over a plain file of fixed-size pages.
///
/// Suitable when the host exposes its data file directly rather than
/// through a buffer manager.
pub struct FileDataSource {
    file: StdFileIo,
    page_size: u64,
}

impl FileDataSource {
    pub fn open(path: impl AsRef<Path>, page_size: u64) -> Result<Self> {
        let file = StdFileIo::open_rw(path)?;
        Ok(Self { file, page_size })
    }

    pub fn file(&self) -> &StdFileIo {
        &self.file
    }
}

impl DataSource for FileDataSource {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn num_pages(&self) -> Result<u64> {
        let len = self.file.len()?;
        if len % self.page_size != 0 {
            return Err(BackupError::Corruption("data file length not page aligned"));
        }
        Ok(len / self.page_size)
    }

    fn read_page(&self, page: PageId, dst: &mut [u8]) -> Result<()> {
        self.file.read_at(page.0 * self.page_size, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn wal_and_lock_paths_derive_from_db_path() {
        let host = HostInfo {
            db_id: "db-1".into(),
            db_path: PathBuf::from("/data/graph.db"),
            engine_version: "0.1.0".into(),
        };
        assert_eq!(host.wal_path(), PathBuf::from("/data/graph.db.wal"));
        assert_eq!(host.lock_path(), PathBuf::from("/data/graph.db.lock"));
        assert_eq!(host.db_basename().unwrap(), OsString::from("graph.db"));
    }

    #[test]
    fn file_data_source_counts_and_reads_pages() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let source = FileDataSource::open(&path, 512)?;
        source.file().write_at(0, &[7u8; 512])?;
        source.file().write_at(512, &[9u8; 512])?;
        assert_eq!(source.num_pages()?, 2);

        let mut buf = vec![0u8; 512];
        source.read_page(PageId(1), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 9));
        Ok(())
    }

    #[test]
    fn unaligned_data_file_is_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ragged.db");
        let source = FileDataSource::open(&path, 512)?;
        source.file().write_at(0, &[1u8; 700])?;
        assert!(matches!(
            source.num_pages(),
            Err(BackupError::Corruption(_))
        ));
        Ok(())
    }
}
