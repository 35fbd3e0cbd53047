//! Backup manifest: the self-describing record whose presence marks a
//! backup directory as complete and consumable.
//!
//! On-disk layout, little-endian:
//!
//! ```text
//! u64   snapshot_timestamp
//! u32   db_id_len          bytes[db_id_len]    db_id (utf-8)
//! u32   db_path_len        bytes[db_path_len]  db_path (utf-8)
//! u64   backup_timestamp
//! u64   page_count
//! u64   backup_size_bytes
//! u32   version_len        bytes[version_len]  engine_version (utf-8)
//! u32   ext_len            bytes[ext_len]      extension region
//! ```
//!
//! The extension region is a sequence of `(u16 tag, u32 len, bytes)` fields.
//! Readers skip tags they do not understand, so fields can be added without
//! breaking older readers. Tag 1 carries the CRC32 of the backup data file.

use std::path::Path;

use crate::io::{FileIo, StdFileIo};
use crate::types::{BackupError, Result};

pub const MANIFEST_FILE_NAME: &str = "backup_manifest";

const EXT_TAG_DATA_CRC32: u16 = 1;
const EXT_FIELD_HDR_LEN: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    /// Logical timestamp the backup represents.
    pub snapshot_ts: u64,
    /// Opaque identifier of the source database.
    pub db_id: String,
    /// Original path of the source data file.
    pub db_path: String,
    /// Wall-clock seconds since the epoch when the backup started.
    pub backup_ts: u64,
    /// Pages written to the backup data file.
    pub page_count: u64,
    /// Size of the backup data file in bytes.
    pub size_bytes: u64,
    /// Engine version that produced the backup.
    pub engine_version: String,
    /// CRC32 of the backup data file, carried in the extension region.
    pub data_crc32: Option<u32>,
}

impl Manifest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            8 + 4
                + self.db_id.len()
                + 4
                + self.db_path.len()
                + 8
                + 8
                + 8
                + 4
                + self.engine_version.len()
                + 4
                + EXT_FIELD_HDR_LEN
                + 4,
        );
        buf.extend_from_slice(&self.snapshot_ts.to_le_bytes());
        put_string(&mut buf, &self.db_id);
        put_string(&mut buf, &self.db_path);
        buf.extend_from_slice(&self.backup_ts.to_le_bytes());
        buf.extend_from_slice(&self.page_count.to_le_bytes());
        buf.extend_from_slice(&self.size_bytes.to_le_bytes());
        put_string(&mut buf, &self.engine_version);

        let ext = self.encode_ext();
        buf.extend_from_slice(&(ext.len() as u32).to_le_bytes());
        buf.extend_from_slice(&ext);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let snapshot_ts = reader.u64()?;
        let db_id = reader.string()?;
        let db_path = reader.string()?;
        let backup_ts = reader.u64()?;
        let page_count = reader.u64()?;
        let size_bytes = reader.u64()?;
        let engine_version = reader.string()?;
        let ext_len = reader.u32()? as usize;
        let ext = reader.take(ext_len)?;
        let data_crc32 = decode_ext(ext);
        Ok(Self {
            snapshot_ts,
            db_id,
            db_path,
            backup_ts,
            page_count,
            size_bytes,
            engine_version,
            data_crc32,
        })
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = StdFileIo::create(path)?;
        file.write_at(0, &self.encode())?;
        file.sync_all()
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let file = StdFileIo::open_read(path)?;
        let len = file.len()?;
        let mut buf = vec![0u8; len as usize];
        file.read_at(0, &mut buf)?;
        Self::decode(&buf)
    }

    fn encode_ext(&self) -> Vec<u8> {
        let mut ext = Vec::new();
        if let Some(crc) = self.data_crc32 {
            ext.extend_from_slice(&EXT_TAG_DATA_CRC32.to_le_bytes());
            ext.extend_from_slice(&4u32.to_le_bytes());
            ext.extend_from_slice(&crc.to_le_bytes());
        }
        ext
    }
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Walks the extension fields, keeping the ones this reader understands.
/// Unknown tags and any trailing bytes that do not form a whole field are
/// skipped rather than rejected.
fn decode_ext(mut ext: &[u8]) -> Option<u32> {
    let mut data_crc32 = None;
    while ext.len() >= EXT_FIELD_HDR_LEN {
        let tag = u16::from_le_bytes([ext[0], ext[1]]);
        let len = u32::from_le_bytes([ext[2], ext[3], ext[4], ext[5]]) as usize;
        let Some(field) = ext.get(EXT_FIELD_HDR_LEN..EXT_FIELD_HDR_LEN + len) else {
            break;
        };
        if tag == EXT_TAG_DATA_CRC32 && len == 4 {
            data_crc32 = Some(u32::from_le_bytes([field[0], field[1], field[2], field[3]]));
        }
        ext = &ext[EXT_FIELD_HDR_LEN + len..];
    }
    data_crc32
}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(len)
            .ok_or(BackupError::ManifestCorrupt("manifest length overflow"))?;
        let slice = self
            .buf
            .get(self.off..end)
            .ok_or(BackupError::ManifestCorrupt("manifest truncated"))?;
        self.off = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BackupError::ManifestCorrupt("manifest string is not utf-8"))
    }
}
