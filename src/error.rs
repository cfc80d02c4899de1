//! Error types for hostfs
//!
//! Every failure surfaced by the filesystem carries an [`ErrorKind`], the
//! protocol-level status a network filesystem server reports to its client.

use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level status kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    QuotaExceeded,
    AlreadyExists,
    TooLarge,
    IoFailure,
    IsADirectory,
    NameTooLong,
    NoSuchDevice,
    NotFound,
    NoSpace,
    NotADirectory,
    DirectoryNotEmpty,
    NoSuchDeviceOrAddress,
    OperationNotPermitted,
    ReadOnlyFilesystem,
    StaleHandle,
    /// Fallback for unmapped host errors and internal faults
    GenericIo,
}

impl ErrorKind {
    /// Translate a host errno through the fixed mapping table.
    ///
    /// Returns `None` for codes without a table entry; callers collapse
    /// those to [`ErrorKind::GenericIo`].
    pub fn from_errno(errno: i32) -> Option<Self> {
        let kind = match errno {
            libc::EACCES => ErrorKind::PermissionDenied,
            libc::EDQUOT => ErrorKind::QuotaExceeded,
            libc::EEXIST => ErrorKind::AlreadyExists,
            libc::EFBIG => ErrorKind::TooLarge,
            libc::EIO => ErrorKind::IoFailure,
            libc::EISDIR => ErrorKind::IsADirectory,
            libc::ENAMETOOLONG => ErrorKind::NameTooLong,
            libc::ENODEV => ErrorKind::NoSuchDevice,
            libc::ENOENT => ErrorKind::NotFound,
            libc::ENOSPC => ErrorKind::NoSpace,
            libc::ENOTDIR => ErrorKind::NotADirectory,
            libc::ENOTEMPTY => ErrorKind::DirectoryNotEmpty,
            libc::ENXIO => ErrorKind::NoSuchDeviceOrAddress,
            libc::EPERM => ErrorKind::OperationNotPermitted,
            libc::EROFS => ErrorKind::ReadOnlyFilesystem,
            libc::ESTALE => ErrorKind::StaleHandle,
            _ => return None,
        };
        Some(kind)
    }

    /// NFSv3 status code (`NFS3ERR_*`) for this kind
    pub fn nfs_code(&self) -> u32 {
        match self {
            ErrorKind::OperationNotPermitted => 1,
            ErrorKind::NotFound => 2,
            ErrorKind::IoFailure | ErrorKind::GenericIo => 5,
            ErrorKind::NoSuchDeviceOrAddress => 6,
            ErrorKind::PermissionDenied => 13,
            ErrorKind::AlreadyExists => 17,
            ErrorKind::NoSuchDevice => 19,
            ErrorKind::NotADirectory => 20,
            ErrorKind::IsADirectory => 21,
            ErrorKind::TooLarge => 27,
            ErrorKind::NoSpace => 28,
            ErrorKind::ReadOnlyFilesystem => 30,
            ErrorKind::NameTooLong => 63,
            ErrorKind::DirectoryNotEmpty => 66,
            ErrorKind::QuotaExceeded => 69,
            ErrorKind::StaleHandle => 70,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::QuotaExceeded => "quota exceeded",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::TooLarge => "file too large",
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::IsADirectory => "is a directory",
            ErrorKind::NameTooLong => "name too long",
            ErrorKind::NoSuchDevice => "no such device",
            ErrorKind::NotFound => "not found",
            ErrorKind::NoSpace => "no space left",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::DirectoryNotEmpty => "directory not empty",
            ErrorKind::NoSuchDeviceOrAddress => "no such device or address",
            ErrorKind::OperationNotPermitted => "operation not permitted",
            ErrorKind::ReadOnlyFilesystem => "read-only filesystem",
            ErrorKind::StaleHandle => "stale handle",
            ErrorKind::GenericIo => "I/O error",
        };
        f.write_str(s)
    }
}

/// Main error type for hostfs
#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind}: {context}")]
    Fs { kind: ErrorKind, context: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),
}

impl Error {
    /// Build a filesystem error with the given status and context
    pub fn fs(kind: ErrorKind, context: impl Into<String>) -> Self {
        Error::Fs {
            kind,
            context: context.into(),
        }
    }

    /// Translate a failed host call made by `op` on `path`.
    ///
    /// Codes without a table entry become [`ErrorKind::GenericIo`] and are
    /// logged at critical severity.
    pub fn host(op: &str, path: &Path, err: io::Error) -> Self {
        let kind = match err.raw_os_error().and_then(ErrorKind::from_errno) {
            Some(kind) => kind,
            None => {
                error!("{}: unexpected host error on {:?}: {}", op, path, err);
                ErrorKind::GenericIo
            }
        };
        Error::fs(kind, format!("{} {:?}: {}", op, path, err))
    }

    /// Internal fault: logged at critical severity, reported as generic I/O
    pub fn fault(op: &str, detail: impl fmt::Display) -> Self {
        error!("{}: internal fault: {}", op, detail);
        Error::fs(ErrorKind::GenericIo, format!("{}: {}", op, detail))
    }

    /// Protocol status for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fs { kind, .. } => *kind,
            _ => ErrorKind::GenericIo,
        }
    }
}
