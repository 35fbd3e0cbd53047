//! Positioned file I/O and the small filesystem surface the backup core
//! needs from its host environment.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::{BackupError, Result};

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Offset-addressed file handle.
///
/// All reads and writes are positioned; there is no shared cursor, so a
/// handle may be used from multiple threads at once.
pub trait FileIo: Send + Sync + 'static {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// `FileIo` over a standard filesystem file.
///
/// Keeps the opening path so I/O failures report which file they hit.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
    path: PathBuf,
}

impl StdFileIo {
    /// Opens an existing file read-only.
    pub fn open_read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| BackupError::io("open", path, err))?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Opens a file for reading and writing, creating it if absent.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| BackupError::io("open", path, err))?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Creates (or truncates) a file for writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| BackupError::io("create", path, err))?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        let mut pos = 0usize;
        while pos < dst.len() {
            let read = self.file.read_at(&mut dst[pos..], off + pos as u64)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read past end of file",
                ));
            }
            pos += read;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_all_at(&self, off: u64, src: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        let mut pos = 0usize;
        while pos < src.len() {
            let written = self.file.write_at(&src[pos..], off + pos as u64)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "wrote zero bytes"));
            }
            pos += written;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut pos = 0usize;
        while pos < dst.len() {
            let read = self.file.seek_read(&mut dst[pos..], off + pos as u64)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read past end of file",
                ));
            }
            pos += read;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write_all_at(&self, off: u64, src: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut pos = 0usize;
        while pos < src.len() {
            let written = self.file.seek_write(&src[pos..], off + pos as u64)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "wrote zero bytes"));
            }
            pos += written;
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact_at(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "positioned file io unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all_at(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "positioned file io unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact_at(off, dst)
            .map_err(|err| BackupError::io("read_at", &self.path, err))
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all_at(off, src)
            .map_err(|err| BackupError::io("write_at", &self.path, err))
    }

    fn sync_all(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|err| BackupError::io("sync", &self.path, err))
    }

    fn len(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(|err| BackupError::io("stat", &self.path, err))?;
        Ok(meta.len())
    }
}

pub fn exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

pub fn file_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let meta = fs::metadata(path).map_err(|err| BackupError::io("stat", path, err))?;
    Ok(meta.len())
}

pub fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).map_err(|err| BackupError::io("create_dir", path, err))
}

pub fn remove_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::remove_file(path).map_err(|err| BackupError::io("remove", path, err))
}

pub fn dir_is_empty(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let mut entries = fs::read_dir(path).map_err(|err| BackupError::io("read_dir", path, err))?;
    Ok(entries.next().is_none())
}

/// Copies `src` to `dst` in bounded chunks, returning the bytes copied.
/// `dst` is created or truncated and synced before returning.
pub fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<u64> {
    let src = StdFileIo::open_read(src)?;
    let dst = StdFileIo::create(dst)?;
    let total = src.len()?;
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut off = 0u64;
    while off < total {
        let chunk = (total - off).min(COPY_CHUNK_BYTES as u64) as usize;
        src.read_at(off, &mut buf[..chunk])?;
        dst.write_at(off, &buf[..chunk])?;
        off += chunk as u64;
    }
    dst.sync_all()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positioned_write_then_read() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = StdFileIo::create(dir.path().join("scratch.bin"))?;
        io.write_at(16, b"backup bytes")?;
        io.sync_all()?;
        let mut buf = [0u8; 12];
        io.read_at(16, &mut buf)?;
        assert_eq!(&buf, b"backup bytes");
        assert_eq!(io.len()?, 28);
        Ok(())
    }

    #[test]
    fn short_read_reports_unexpected_eof() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = StdFileIo::create(dir.path().join("short.bin"))?;
        io.write_at(0, b"abc")?;
        let mut buf = [0u8; 8];
        match io.read_at(0, &mut buf) {
            Err(BackupError::Io { op, source, .. }) => {
                assert_eq!(op, "read_at");
                assert_eq!(source.kind(), ErrorKind::UnexpectedEof);
            }
            other => panic!("expected io error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn copy_file_matches_source() -> Result<()> {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("src.bin");
        let dst_path = dir.path().join("dst.bin");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let src = StdFileIo::create(&src_path)?;
        src.write_at(0, &payload)?;
        src.sync_all()?;

        let copied = copy_file(&src_path, &dst_path)?;
        assert_eq!(copied, payload.len() as u64);

        let dst = StdFileIo::open_read(&dst_path)?;
        let mut round = vec![0u8; payload.len()];
        dst.read_at(0, &mut round)?;
        assert_eq!(round, payload);
        Ok(())
    }

    #[test]
    fn copy_file_handles_empty_source() -> Result<()> {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("empty.bin");
        StdFileIo::create(&src_path)?;
        let copied = copy_file(&src_path, dir.path().join("empty_copy.bin"))?;
        assert_eq!(copied, 0);
        assert_eq!(file_size(dir.path().join("empty_copy.bin"))?, 0);
        Ok(())
    }

    #[test]
    fn dir_is_empty_distinguishes() -> Result<()> {
        let dir = tempdir().unwrap();
        assert!(dir_is_empty(dir.path())?);
        StdFileIo::create(dir.path().join("x"))?;
        assert!(!dir_is_empty(dir.path())?);
        Ok(())
    }
}
