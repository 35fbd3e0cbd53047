use std::fmt;
use std::io;
use std::path::PathBuf;

/// Index of a fixed-size page in the paged data file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

/// Lifecycle state of a backup.
///
/// A single backup traverses a prefix of
/// `Idle -> InProgress -> Finalizing -> Completed` or terminates at `Failed`.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BackupState {
    Idle = 0,
    InProgress = 1,
    Finalizing = 2,
    Completed = 3,
    Failed = 4,
}

impl BackupState {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BackupState::InProgress,
            2 => BackupState::Finalizing,
            3 => BackupState::Completed,
            4 => BackupState::Failed,
            _ => BackupState::Idle,
        }
    }

    /// True once the backup can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, BackupState::Completed | BackupState::Failed)
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Idle => "idle",
            BackupState::InProgress => "in_progress",
            BackupState::Finalizing => "finalizing",
            BackupState::Completed => "completed",
            BackupState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("backup already active")]
    AlreadyActive,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("{op} failed on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("backup cancelled")]
    Cancelled,
    #[error("size mismatch: expected {expected} bytes, found {found}")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("manifest corrupt: {0}")]
    ManifestCorrupt(&'static str),
    #[error("missing file: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("page {0} not preserved in shadow store")]
    NotPreserved(PageId),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("no backup found at {}", .0.display())]
    BackupNotFound(PathBuf),
    #[error("restore target {} exists and is not empty", .0.display())]
    TargetExists(PathBuf),
}

impl BackupError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
