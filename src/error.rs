use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for fuse-harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("File too large: inode {0}")]
    FileTooLarge(u64),

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Mount initialization failed at {path}: {source}")]
    MountInit {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Service loop ended before the driver signalled readiness")]
    ServiceLoop,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Isolation pool is shut down")]
    PoolClosed,

    #[error("Isolation worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl HarnessError {
    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            HarnessError::NotFound(_) => libc::ENOENT,
            HarnessError::AlreadyExists(_) => libc::EEXIST,
            HarnessError::NotADirectory(_) => libc::ENOTDIR,
            HarnessError::IsADirectory(_) => libc::EISDIR,
            HarnessError::FileTooLarge(_) => libc::EFBIG,
            HarnessError::ReadOnly => libc::EROFS,
            HarnessError::PermissionDenied => libc::EACCES,
            HarnessError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            HarnessError::Config(_) => libc::EINVAL,
            HarnessError::MountInit { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            HarnessError::ServiceLoop => libc::EIO,
            HarnessError::InvalidState(_) => libc::EINVAL,
            HarnessError::Timeout(_) => libc::ETIMEDOUT,
            HarnessError::PoolClosed => libc::EIO,
            HarnessError::WorkerPanicked(_) => libc::EIO,
            HarnessError::Backend(_) => libc::EIO,
        }
    }
}

/// Result type alias for fuse-harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;
