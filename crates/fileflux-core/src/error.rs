//! Error taxonomy shared by the engine, its backends and its callers.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by filesystem operations.
///
/// The variants are status codes rather than rich error chains: callers
/// compare them (`matches!(err, FsError::NotEmpty)`) and the engine forwards
/// backend errors verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FsError {
    /// File or directory not found.
    #[error("not found")]
    NotFound,

    /// The path already exists.
    #[error("already exists")]
    AlreadyExists,

    /// Expected a file but found something else.
    #[error("not a file")]
    NotAFile,

    /// Expected a directory but found something else.
    #[error("not a directory")]
    NotADirectory,

    /// Directory is not empty.
    #[error("directory not empty")]
    NotEmpty,

    /// The request is not valid for the target, or not supported by it.
    #[error("invalid operation")]
    InvalidOperation,

    /// The quota budget is exhausted.
    #[error("no space left in quota")]
    NoSpace,

    /// The operation was cancelled.
    #[error("operation aborted")]
    Aborted,

    /// Generic or backend-specific failure.
    #[error("operation failed: {0}")]
    Failed(String),
}

impl FsError {
    /// Create a generic failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::NotADirectory => Self::NotADirectory,
            io::ErrorKind::IsADirectory => Self::NotAFile,
            io::ErrorKind::DirectoryNotEmpty => Self::NotEmpty,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => Self::NoSpace,
            io::ErrorKind::InvalidInput => Self::InvalidOperation,
            _ => Self::Failed(e.to_string()),
        }
    }
}

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;
