//! Value types exchanged between the engine and storage backends.

use std::path::PathBuf;
use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Metadata of a file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Whether the node is a directory.
    pub is_directory: bool,
    /// Size in bytes (zero for directories).
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

impl FileInfo {
    /// Metadata for a regular file.
    pub fn file(size: u64, modified: SystemTime) -> Self {
        Self {
            is_directory: false,
            size,
            modified,
        }
    }

    /// Metadata for a directory.
    pub fn directory(modified: SystemTime) -> Self {
        Self {
            is_directory: true,
            size: 0,
            modified,
        }
    }
}

/// A single directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not a full path).
    pub name: CompactString,
    /// Whether the entry is a directory.
    pub is_directory: bool,
}

impl DirEntry {
    /// A file entry.
    pub fn file(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
        }
    }

    /// A directory entry.
    pub fn directory(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
        }
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryBatch {
    /// Entries in this page.
    pub entries: Vec<DirEntry>,
    /// Whether another page follows.
    pub has_more: bool,
}

/// What `create_or_open` does when the file does or does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenDisposition {
    /// Open an existing file; fail with `NotFound` otherwise.
    #[default]
    Open,
    /// Create a new file; fail with `AlreadyExists` otherwise.
    Create,
    /// Open the file, creating it if missing.
    OpenAlways,
    /// Create the file, truncating it if present.
    CreateAlways,
    /// Open an existing file and truncate it.
    OpenTruncated,
}

/// Flags for opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Creation/truncation behaviour.
    pub disposition: OpenDisposition,
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Writes append to the end of the file.
    pub append: bool,
}

impl OpenFlags {
    /// Open an existing file for reading.
    pub fn read_only() -> Self {
        Self {
            disposition: OpenDisposition::Open,
            read: true,
            ..Default::default()
        }
    }

    /// Open (creating if needed) a file for writing.
    pub fn write() -> Self {
        Self {
            disposition: OpenDisposition::OpenAlways,
            write: true,
            ..Default::default()
        }
    }

    /// Open an existing file for writing.
    pub fn write_existing() -> Self {
        Self {
            disposition: OpenDisposition::Open,
            write: true,
            ..Default::default()
        }
    }

    /// Create or truncate a file for writing.
    pub fn create_always() -> Self {
        Self {
            disposition: OpenDisposition::CreateAlways,
            write: true,
            ..Default::default()
        }
    }

    /// Whether opening with these flags can change storage.
    pub fn is_mutating(&self) -> bool {
        self.write
            || self.append
            || !matches!(self.disposition, OpenDisposition::Open)
    }

    /// Whether opening may create the file.
    pub fn may_create(&self) -> bool {
        matches!(
            self.disposition,
            OpenDisposition::Create | OpenDisposition::OpenAlways | OpenDisposition::CreateAlways
        )
    }

    /// Whether opening truncates an existing file.
    pub fn truncates(&self) -> bool {
        matches!(
            self.disposition,
            OpenDisposition::CreateAlways | OpenDisposition::OpenTruncated
        )
    }
}

/// Options for copy and move requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CopyOrMoveOptions {
    /// Carry the source modification time over to the destination.
    pub preserve_last_modified: bool,
    /// Flush streamed copies to durable storage before completing.
    pub flush_on_completion: bool,
}

impl CopyOrMoveOptions {
    /// Preserve modification times.
    pub fn preserving_last_modified() -> Self {
        Self {
            preserve_last_modified: true,
            ..Default::default()
        }
    }
}

/// Where the bytes of a snapshot live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotContents {
    /// A host file that can be read directly.
    Native(PathBuf),
    /// An in-memory copy of the file.
    Bytes(Vec<u8>),
}

/// A read-only snapshot of a file, suitable for handing out to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    /// Metadata at snapshot time.
    pub info: FileInfo,
    /// Snapshot contents.
    pub contents: SnapshotContents,
}
