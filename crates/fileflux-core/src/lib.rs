//! Core types and traits for fileflux.
//!
//! This crate provides the vocabulary shared by the operation engine and
//! its storage backends: logical paths, the error taxonomy, metadata types,
//! observer interfaces, and engine configuration.

mod config;
mod error;
mod observer;
mod path;
mod types;

pub use config::{
    DEFAULT_MAX_INFLIGHT_OPERATIONS, DEFAULT_STREAM_COPY_CHUNK_SIZE, EngineConfig,
    EngineConfigBuilder,
};
pub use error::{FsError, FsResult};
pub use observer::{AccessObserver, ChangeObserver, ObserverSet, UpdateObserver};
pub use path::{LogicalPath, StorageScope, VirtualPath};
pub use types::{
    CopyOrMoveOptions, DirEntry, DirectoryBatch, FileInfo, OpenDisposition, OpenFlags,
    SnapshotContents, SnapshotFile,
};
