//! The storage backend interface and the scope registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use fileflux_core::{
    CopyOrMoveOptions, DirectoryBatch, FileInfo, FsError, FsResult, LogicalPath, OpenFlags,
    SnapshotFile, StorageScope,
};

use crate::context::OperationContext;
use crate::progress::ProgressSink;

/// Primitive file operations for one storage scope.
///
/// Every call receives a fresh [`OperationContext`]. Backends check growth
/// against it, record size changes on it, and notify its change observers.
/// A primitive must not report success for work it did not complete.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Create an empty file. Returns whether a new file was created.
    ///
    /// With `exclusive`, an existing entry yields `AlreadyExists`; otherwise
    /// an existing file is left untouched.
    async fn create_file(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        exclusive: bool,
    ) -> FsResult<bool>;

    /// Create a directory, and its missing parents when `recursive`.
    async fn create_directory(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        exclusive: bool,
        recursive: bool,
    ) -> FsResult<()>;

    /// Metadata for one entry.
    async fn get_info(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<FileInfo>;

    /// One page of a directory listing starting at `offset`.
    async fn read_directory(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        offset: usize,
        limit: usize,
    ) -> FsResult<DirectoryBatch>;

    /// Delete a file. Directories yield `NotAFile`.
    async fn delete_file(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<()>;

    /// Delete an empty directory.
    async fn delete_directory(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<()>;

    /// Delete a whole subtree in one call.
    ///
    /// Backends without a bulk delete return `InvalidOperation` and the
    /// engine falls back to a tree walk.
    async fn delete_recursively(
        &self,
        _ctx: OperationContext,
        _path: &LogicalPath,
    ) -> FsResult<()> {
        Err(FsError::InvalidOperation)
    }

    /// Copy one file within this backend.
    async fn copy_file_local(
        &self,
        ctx: OperationContext,
        src: &LogicalPath,
        dest: &LogicalPath,
        options: CopyOrMoveOptions,
        progress: Option<&ProgressSink>,
    ) -> FsResult<()>;

    /// Move one file within this backend.
    async fn move_file_local(
        &self,
        ctx: OperationContext,
        src: &LogicalPath,
        dest: &LogicalPath,
        options: CopyOrMoveOptions,
    ) -> FsResult<()>;

    /// Import a file from the host filesystem.
    async fn copy_in_foreign_file(
        &self,
        ctx: OperationContext,
        native: &Path,
        dest: &LogicalPath,
    ) -> FsResult<()>;

    /// Set a file's length, zero-filling when it grows.
    async fn truncate(&self, ctx: OperationContext, path: &LogicalPath, length: u64)
    -> FsResult<()>;

    /// Set access and modification times.
    async fn touch(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> FsResult<()>;

    /// Open (and possibly create or truncate) a file according to `flags`.
    async fn create_or_open(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        flags: OpenFlags,
    ) -> FsResult<FileInfo>;

    /// Read up to `len` bytes at `offset`. Short reads only happen at EOF.
    async fn read(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        offset: u64,
        len: usize,
    ) -> FsResult<Vec<u8>>;

    /// Write `data` at `offset`, extending the file as needed.
    async fn write(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize>;

    /// Persist pending writes for a file.
    async fn flush(&self, _ctx: OperationContext, _path: &LogicalPath) -> FsResult<()> {
        Ok(())
    }

    /// Produce a readable snapshot of a file.
    async fn create_snapshot_file(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
    ) -> FsResult<SnapshotFile>;
}

/// Maps storage scopes to the backends serving them.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<StorageScope, Arc<dyn StorageBackend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.backends.iter().map(|(scope, b)| (scope, b.name())))
            .finish()
    }
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` for `scope`, replacing any previous one.
    pub fn with_backend(
        mut self,
        scope: impl Into<StorageScope>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        self.register(scope, backend);
        self
    }

    /// Register `backend` for `scope`, replacing any previous one.
    pub fn register(&mut self, scope: impl Into<StorageScope>, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(scope.into(), backend);
    }

    /// Find the backend for `scope`.
    pub fn resolve(&self, scope: &StorageScope) -> FsResult<Arc<dyn StorageBackend>> {
        self.backends
            .get(scope)
            .cloned()
            .ok_or_else(|| FsError::failed(format!("no backend registered for scope {scope}")))
    }

    /// Registered scopes.
    pub fn scopes(&self) -> impl Iterator<Item = &StorageScope> {
        self.backends.keys()
    }
}
