//! Single-use operations and their lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use fileflux_core::{
    CopyOrMoveOptions, DirEntry, EngineConfig, FileInfo, FsError, FsResult, LogicalPath,
    ObserverSet, OpenFlags, SnapshotFile, StorageScope,
};
use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::backend::StorageBackend;
use crate::context::{ContextFactory, OperationContext, QuotaBudget};
use crate::copy_move::{TransferEndpoints, TransferMode, TransferSettings, copy_or_move};
use crate::progress::ProgressSink;
use crate::quota::QuotaGate;
use crate::remove::{RemoveStrategy, remove_recursively};
use crate::traversal::DirectoryLister;

/// Identifier assigned to each operation by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The public operations the runner accepts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    CreateFile,
    CreateDirectory,
    Copy,
    Move,
    DirectoryExists,
    FileExists,
    GetMetadata,
    ReadDirectory,
    Remove,
    Write,
    Truncate,
    TouchFile,
    OpenFile,
    CreateSnapshotFile,
    CopyInForeignFile,
    RemoveFile,
    RemoveDirectory,
    CopyFileLocal,
    MoveFileLocal,
}

impl OperationKind {
    /// Kinds that consult the quota gate before running.
    ///
    /// `OpenFile` is gated only when its flags may grow the file; the runner
    /// decides that per call.
    pub fn requires_quota(self) -> bool {
        matches!(
            self,
            Self::CreateFile
                | Self::CreateDirectory
                | Self::Copy
                | Self::Move
                | Self::Write
                | Self::Truncate
                | Self::CopyInForeignFile
                | Self::CopyFileLocal
                | Self::MoveFileLocal
        )
    }

    /// Kinds that honor a cancel request while running.
    ///
    /// `Remove` is interruptible only when recursive.
    pub fn is_interruptible(self) -> bool {
        matches!(self, Self::Write | Self::Truncate | Self::Copy | Self::Move)
    }
}

/// Lifecycle of an [`Operation`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum OperationState {
    Created,
    QuotaPending,
    Executing,
    Done,
}

/// One request against one backend.
///
/// An operation is created by the runner, optionally admitted through the
/// quota gate, then consumed by exactly one of its dispatch methods.
pub struct Operation {
    id: OperationId,
    kind: OperationKind,
    state: OperationState,
    backend: Arc<dyn StorageBackend>,
    contexts: ContextFactory,
    cancel: CancellationToken,
    config: Arc<EngineConfig>,
}

impl Operation {
    /// Create an operation. Growth is refused until quota is reserved.
    pub(crate) fn new(
        id: OperationId,
        kind: OperationKind,
        backend: Arc<dyn StorageBackend>,
        observers: Arc<ObserverSet>,
        cancel: CancellationToken,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            id,
            kind,
            state: OperationState::Created,
            backend,
            contexts: ContextFactory::ungated(observers),
            cancel,
            config,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// The budget shared by every context this operation creates.
    pub fn budget(&self) -> &QuotaBudget {
        self.contexts.budget()
    }

    fn transition(&mut self, next: OperationState) {
        debug_assert!(
            next > self.state,
            "operation {} moved from {} to {}",
            self.id,
            self.state,
            next
        );
        trace!(id = %self.id, kind = %self.kind, from = %self.state, to = %next, "state change");
        self.state = next;
    }

    /// Ask the quota gate how much `scope` may grow.
    ///
    /// A failing gate ends the operation with `Failed`.
    pub async fn reserve_quota(&mut self, gate: &dyn QuotaGate, scope: &StorageScope) -> FsResult<()> {
        self.transition(OperationState::QuotaPending);
        match gate.get_usage_and_quota(scope).await {
            Ok(status) => {
                let allowed = status.allowed_growth();
                trace!(id = %self.id, %scope, allowed, "quota reserved");
                self.contexts = ContextFactory::new(
                    QuotaBudget::new(scope.clone(), allowed),
                    self.contexts.observers().clone(),
                );
                Ok(())
            }
            Err(err) => {
                warn!(id = %self.id, %scope, error = %err, "quota lookup failed");
                self.transition(OperationState::Done);
                Err(FsError::failed(err.to_string()))
            }
        }
    }

    fn begin(&mut self) -> OperationContext {
        self.transition(OperationState::Executing);
        self.contexts.context()
    }

    /// Conclude the operation. Success after a cancel request is `Aborted`.
    fn finish<T>(mut self, result: FsResult<T>) -> FsResult<T> {
        self.transition(OperationState::Done);
        match result {
            Ok(_) if self.cancel.is_cancelled() => Err(FsError::Aborted),
            other => other,
        }
    }

    fn lister(&self) -> DirectoryLister {
        DirectoryLister::new(
            self.backend.clone(),
            self.contexts.clone(),
            self.config.directory_page_size,
        )
    }

    pub async fn create_file(mut self, path: &LogicalPath, exclusive: bool) -> FsResult<()> {
        let ctx = self.begin();
        let result = self.backend.create_file(ctx, path, exclusive).await.map(|_| ());
        self.finish(result)
    }

    pub async fn create_directory(
        mut self,
        path: &LogicalPath,
        exclusive: bool,
        recursive: bool,
    ) -> FsResult<()> {
        let ctx = self.begin();
        let result = self
            .backend
            .create_directory(ctx, path, exclusive, recursive)
            .await;
        self.finish(result)
    }

    pub async fn directory_exists(mut self, path: &LogicalPath) -> FsResult<()> {
        let ctx = self.begin();
        let result = match self.backend.get_info(ctx, path).await {
            Ok(info) if info.is_directory => Ok(()),
            Ok(_) => Err(FsError::NotADirectory),
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    pub async fn file_exists(mut self, path: &LogicalPath) -> FsResult<()> {
        let ctx = self.begin();
        let result = match self.backend.get_info(ctx, path).await {
            Ok(info) if info.is_directory => Err(FsError::NotAFile),
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    pub async fn get_metadata(mut self, path: &LogicalPath) -> FsResult<FileInfo> {
        let ctx = self.begin();
        let result = self.backend.get_info(ctx, path).await;
        self.finish(result)
    }

    pub async fn read_directory(mut self, path: &LogicalPath) -> FsResult<Vec<DirEntry>> {
        let ctx = self.begin();
        let result = match self.backend.get_info(ctx, path).await {
            Ok(info) if info.is_directory => self.lister().list(path).await,
            Ok(_) => Err(FsError::NotADirectory),
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    pub async fn remove(mut self, path: &LogicalPath, recursive: bool) -> FsResult<()> {
        let _ = self.begin();
        let result = if recursive {
            remove_recursively(
                self.backend.clone(),
                self.contexts.clone(),
                path,
                self.cancel.clone(),
                self.config.directory_page_size,
                self.config.max_inflight_operations,
            )
            .await
        } else {
            RemoveStrategy::new(self.backend.clone(), self.contexts.clone(), path.clone())
                .remove_single(path)
                .await
        };
        self.finish(result)
    }

    pub async fn remove_file(mut self, path: &LogicalPath) -> FsResult<()> {
        let ctx = self.begin();
        let result = self.backend.delete_file(ctx, path).await;
        self.finish(result)
    }

    pub async fn remove_directory(mut self, path: &LogicalPath) -> FsResult<()> {
        let ctx = self.begin();
        let result = self.backend.delete_directory(ctx, path).await;
        self.finish(result)
    }

    /// Copy or move a tree. `self` runs against the destination backend.
    pub async fn transfer(
        mut self,
        mode: TransferMode,
        src_backend: Arc<dyn StorageBackend>,
        src: &LogicalPath,
        dest: &LogicalPath,
        mut options: CopyOrMoveOptions,
        progress: Option<ProgressSink>,
    ) -> FsResult<()> {
        let _ = self.begin();
        options.flush_on_completion |= self.config.flush_on_stream_copy;
        let endpoints = TransferEndpoints {
            src_backend,
            dest_backend: self.backend.clone(),
            src: src.clone(),
            dest: dest.clone(),
        };
        let settings = TransferSettings {
            options,
            chunk_size: self.config.stream_copy_chunk_size,
            page_size: self.config.directory_page_size,
            max_inflight: self.config.max_inflight_operations,
            progress,
        };
        let result = copy_or_move(
            mode,
            endpoints,
            settings,
            self.contexts.clone(),
            self.cancel.clone(),
        )
        .await;
        self.finish(result)
    }

    /// Stream `source` into the file at `path` starting at `offset`.
    ///
    /// Cancellation is checked between chunks. Returns the bytes written.
    pub async fn write<R>(mut self, path: &LogicalPath, offset: u64, mut source: R) -> FsResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let ctx = self.begin();
        let result = async {
            let info = self
                .backend
                .create_or_open(ctx, path, OpenFlags::write_existing())
                .await?;
            if info.is_directory {
                return Err(FsError::NotAFile);
            }

            let mut buf = vec![0u8; self.config.stream_copy_chunk_size];
            let mut written = 0u64;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(FsError::Aborted);
                }
                let n = source.read(&mut buf).await?;
                if n == 0 {
                    return Ok(written);
                }
                let mut chunk = &buf[..n];
                while !chunk.is_empty() {
                    let count = self
                        .backend
                        .write(self.contexts.context(), path, offset + written, chunk)
                        .await?;
                    if count == 0 {
                        return Err(FsError::failed("backend accepted no bytes"));
                    }
                    written += count as u64;
                    chunk = &chunk[count..];
                }
            }
        }
        .await;
        self.finish(result)
    }

    /// Set a file's length. The primitive always runs to completion; a
    /// cancel request only changes the reported result.
    pub async fn truncate(mut self, path: &LogicalPath, length: u64) -> FsResult<()> {
        let ctx = self.begin();
        let result = self.backend.truncate(ctx, path, length).await;
        self.finish(result)
    }

    pub async fn touch_file(
        mut self,
        path: &LogicalPath,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> FsResult<()> {
        let ctx = self.begin();
        let result = self.backend.touch(ctx, path, accessed, modified).await;
        self.finish(result)
    }

    /// Open a file and hand back the backend and budget a handle needs.
    pub async fn open_file(
        mut self,
        path: &LogicalPath,
        flags: OpenFlags,
    ) -> FsResult<(Arc<dyn StorageBackend>, ContextFactory)> {
        let ctx = self.begin();
        let result = match self.backend.create_or_open(ctx, path, flags).await {
            Ok(info) if info.is_directory => Err(FsError::NotAFile),
            Ok(_) => Ok((self.backend.clone(), self.contexts.clone())),
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    pub async fn create_snapshot_file(mut self, path: &LogicalPath) -> FsResult<SnapshotFile> {
        let ctx = self.begin();
        let result = self.backend.create_snapshot_file(ctx, path).await;
        self.finish(result)
    }

    pub async fn copy_in_foreign_file(mut self, native: PathBuf, dest: &LogicalPath) -> FsResult<()> {
        let ctx = self.begin();
        let result = self.backend.copy_in_foreign_file(ctx, &native, dest).await;
        self.finish(result)
    }

    pub async fn copy_file_local(
        mut self,
        src: &LogicalPath,
        dest: &LogicalPath,
        options: CopyOrMoveOptions,
        progress: Option<ProgressSink>,
    ) -> FsResult<()> {
        let ctx = self.begin();
        let result = self
            .backend
            .copy_file_local(ctx, src, dest, options, progress.as_ref())
            .await;
        self.finish(result)
    }

    pub async fn move_file_local(
        mut self,
        src: &LogicalPath,
        dest: &LogicalPath,
        options: CopyOrMoveOptions,
    ) -> FsResult<()> {
        let ctx = self.begin();
        let result = self.backend.move_file_local(ctx, src, dest, options).await;
        self.finish(result)
    }
}
