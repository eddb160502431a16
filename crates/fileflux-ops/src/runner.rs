//! The operation runner: the single entry point for filesystem requests.
//!
//! Each request gets an [`OperationId`] and runs on its own task. Results
//! are delivered through a [`PendingOperation`] future, never before the
//! task has yielded once, so a caller always observes the id before the
//! outcome. Update observers see balanced start/end pairs around every
//! write-class request; access observers see every read-class request.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::SystemTime;

use dashmap::DashMap;
use fileflux_core::{
    CopyOrMoveOptions, DirEntry, EngineConfig, FileInfo, FsError, FsResult, LogicalPath,
    ObserverSet, OpenFlags, SnapshotFile,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backend::{BackendRegistry, StorageBackend};
use crate::copy_move::TransferMode;
use crate::handle::FileHandle;
use crate::operation::{Operation, OperationId, OperationKind};
use crate::progress::{CopyProgress, ProgressSink};
use crate::quota::{MemoryQuota, QuotaGate};

/// Whether an operation is still running or only awaiting delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Running,
    Finished,
}

/// The eventual result of one operation.
#[must_use = "the result of an operation is only observable through this future"]
pub struct PendingOperation<T> {
    id: OperationId,
    rx: oneshot::Receiver<FsResult<T>>,
}

impl<T> PendingOperation<T> {
    /// The id to pass to [`OperationRunner::cancel`].
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl<T> Future for PendingOperation<T> {
    type Output = FsResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(lost_result())))
    }
}

/// The answer to a cancel request.
///
/// Resolves to `Ok` when the cancel took effect and the operation ended
/// `Aborted`, and to `InvalidOperation` otherwise.
#[must_use = "the outcome of a cancel request is only observable through this future"]
pub struct PendingCancel {
    rx: oneshot::Receiver<FsResult<()>>,
}

impl Future for PendingCancel {
    type Output = FsResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(lost_result())))
    }
}

fn lost_result() -> FsError {
    FsError::failed("operation task ended without reporting a result")
}

struct OperationEntry {
    kind: OperationKind,
    status: OperationStatus,
    interruptible: bool,
    cancel: CancellationToken,
    /// Cancels forwarded while the operation was running.
    forwarded: Vec<oneshot::Sender<FsResult<()>>>,
    /// Cancels that arrived after the operation finished.
    stray: Vec<oneshot::Sender<FsResult<()>>>,
}

impl OperationEntry {
    fn new(kind: OperationKind, status: OperationStatus, interruptible: bool) -> Self {
        Self {
            kind,
            status,
            interruptible,
            cancel: CancellationToken::new(),
            forwarded: Vec::new(),
            stray: Vec::new(),
        }
    }

    fn answer_cancels(self, aborted: bool) {
        for tx in self.forwarded {
            let reply = if aborted {
                Ok(())
            } else {
                Err(FsError::InvalidOperation)
            };
            let _ = tx.send(reply);
        }
        for tx in self.stray {
            let _ = tx.send(Err(FsError::InvalidOperation));
        }
    }
}

/// What a request touches and how it is admitted.
struct Request {
    kind: OperationKind,
    target: LogicalPath,
    gated: bool,
    interruptible: bool,
    writes: Vec<LogicalPath>,
    reads: Vec<LogicalPath>,
}

impl Request {
    fn new(kind: OperationKind, target: &LogicalPath) -> Self {
        Self {
            kind,
            target: target.clone(),
            gated: kind.requires_quota(),
            interruptible: kind.is_interruptible(),
            writes: Vec::new(),
            reads: Vec::new(),
        }
    }

    fn writes(mut self, path: &LogicalPath) -> Self {
        self.writes.push(path.clone());
        self
    }

    fn reads(mut self, path: &LogicalPath) -> Self {
        self.reads.push(path.clone());
        self
    }

    fn gated(mut self, gated: bool) -> Self {
        self.gated = gated;
        self
    }

    fn interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }
}

struct Shared {
    registry: BackendRegistry,
    quota: Arc<dyn QuotaGate>,
    observers: Arc<ObserverSet>,
    config: Arc<EngineConfig>,
    operations: DashMap<OperationId, OperationEntry>,
    next_id: AtomicU64,
}

impl Shared {
    fn allocate_id(&self) -> OperationId {
        OperationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Deliver a result: mark finished, yield, send, close the update
    /// bracket, then settle cancels and forget the operation.
    async fn complete<T>(
        &self,
        id: OperationId,
        result: FsResult<T>,
        tx: oneshot::Sender<FsResult<T>>,
        writes: Vec<LogicalPath>,
    ) {
        if let Some(mut entry) = self.operations.get_mut(&id) {
            entry.status = OperationStatus::Finished;
        }
        tokio::task::yield_now().await;

        let aborted = matches!(result, Err(FsError::Aborted));
        match &result {
            Ok(_) => debug!(%id, "operation succeeded"),
            Err(err) => debug!(%id, error = %err, "operation failed"),
        }
        let _ = tx.send(result);

        for path in &writes {
            self.observers.notify_end_update(path);
        }
        if let Some((_, entry)) = self.operations.remove(&id) {
            entry.answer_cancels(aborted);
        }
    }
}

/// Accepts filesystem requests and runs each as an independent task.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct OperationRunner {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRunner")
            .field("registry", &self.shared.registry)
            .field("in_flight", &self.shared.operations.len())
            .finish()
    }
}

impl OperationRunner {
    /// Create a runner.
    pub fn new(
        registry: BackendRegistry,
        quota: Arc<dyn QuotaGate>,
        observers: ObserverSet,
        config: EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                quota,
                observers: Arc::new(observers),
                config: Arc::new(config),
                operations: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A runner with unlimited quota, no observers, and default settings.
    pub fn with_defaults(registry: BackendRegistry) -> Self {
        Self::new(
            registry,
            Arc::new(MemoryQuota::unlimited()),
            ObserverSet::new(),
            EngineConfig::default(),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// A progress channel sized from the configuration.
    pub fn progress_channel(&self) -> (ProgressSink, mpsc::Receiver<CopyProgress>) {
        ProgressSink::channel(self.shared.config.progress_channel_size)
    }

    /// Status of an operation, or `None` once it has been forgotten.
    pub fn status(&self, id: OperationId) -> Option<OperationStatus> {
        self.shared.operations.get(&id).map(|entry| entry.status)
    }

    /// Number of operations not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.shared.operations.len()
    }

    /// Request cancellation of a running operation.
    ///
    /// Unknown ids and operations that cannot be interrupted are answered
    /// with `InvalidOperation`. A cancel arriving after the operation
    /// finished is answered the same way once its result is delivered.
    pub fn cancel(&self, id: OperationId) -> PendingCancel {
        let (tx, rx) = oneshot::channel();
        match self.shared.operations.get_mut(&id) {
            None => {
                trace!(%id, "cancel for unknown operation");
                let _ = tx.send(Err(FsError::InvalidOperation));
            }
            Some(mut entry) => match entry.status {
                OperationStatus::Finished => entry.stray.push(tx),
                OperationStatus::Running if entry.interruptible => {
                    debug!(%id, kind = %entry.kind, "cancelling operation");
                    entry.cancel.cancel();
                    entry.forwarded.push(tx);
                }
                OperationStatus::Running => {
                    trace!(%id, kind = %entry.kind, "operation cannot be interrupted");
                    let _ = tx.send(Err(FsError::InvalidOperation));
                }
            },
        }
        PendingCancel { rx }
    }

    /// Report `err` through the usual deferred path without running anything.
    fn fail<T: Send + 'static>(&self, kind: OperationKind, err: FsError) -> PendingOperation<T> {
        let id = self.shared.allocate_id();
        debug!(%id, %kind, error = %err, "operation rejected");
        let (tx, rx) = oneshot::channel();
        self.shared.operations.insert(
            id,
            OperationEntry::new(kind, OperationStatus::Finished, false),
        );
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.complete(id, Err(err), tx, Vec::new()).await });
        PendingOperation { id, rx }
    }

    fn launch<T, F, Fut>(&self, request: Request, body: F) -> PendingOperation<T>
    where
        T: Send + 'static,
        F: FnOnce(Operation) -> Fut + Send + 'static,
        Fut: Future<Output = FsResult<T>> + Send + 'static,
    {
        let backend = match self.shared.registry.resolve(&request.target.scope) {
            Ok(backend) => backend,
            Err(err) => return self.fail(request.kind, err),
        };

        let id = self.shared.allocate_id();
        let (tx, rx) = oneshot::channel();
        let entry = OperationEntry::new(request.kind, OperationStatus::Running, request.interruptible);
        let cancel = entry.cancel.clone();
        self.shared.operations.insert(id, entry);

        let Request {
            kind,
            target,
            gated,
            writes,
            reads,
            ..
        } = request;
        debug!(%id, %kind, %target, backend = backend.name(), "operation started");
        for path in &writes {
            self.shared.observers.notify_start_update(path);
        }
        for path in &reads {
            self.shared.observers.notify_access(path);
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut op = Operation::new(
                id,
                kind,
                backend,
                shared.observers.clone(),
                cancel,
                shared.config.clone(),
            );
            let admitted = if gated {
                op.reserve_quota(shared.quota.as_ref(), &target.scope).await
            } else {
                Ok(())
            };
            let budget = op.budget().clone();
            let result = match admitted {
                // The entry and update brackets are released even if the body panics.
                Ok(()) => match tokio::spawn(body(op)).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(%id, %kind, error = %err, "operation task failed");
                        Err(FsError::failed(format!("operation task failed: {err}")))
                    }
                },
                Err(err) => Err(err),
            };
            for (scope, delta) in budget.drain_usage() {
                shared.quota.record_usage_delta(&scope, delta);
            }
            shared.complete(id, result, tx, writes).await;
        });

        PendingOperation { id, rx }
    }

    fn resolve_source(&self, src: &LogicalPath) -> FsResult<Arc<dyn StorageBackend>> {
        self.shared.registry.resolve(&src.scope)
    }

    /// Create an empty file.
    pub fn create_file(&self, path: LogicalPath, exclusive: bool) -> PendingOperation<()> {
        let request = Request::new(OperationKind::CreateFile, &path).writes(&path);
        self.launch(request, move |op| async move { op.create_file(&path, exclusive).await })
    }

    /// Create a directory.
    pub fn create_directory(
        &self,
        path: LogicalPath,
        exclusive: bool,
        recursive: bool,
    ) -> PendingOperation<()> {
        let request = Request::new(OperationKind::CreateDirectory, &path).writes(&path);
        self.launch(request, move |op| async move {
            op.create_directory(&path, exclusive, recursive).await
        })
    }

    /// Copy a file or directory tree.
    pub fn copy(
        &self,
        src: LogicalPath,
        dest: LogicalPath,
        options: CopyOrMoveOptions,
    ) -> PendingOperation<()> {
        self.transfer(TransferMode::Copy, src, dest, options, None)
    }

    /// Copy a file or directory tree, reporting progress to `progress`.
    pub fn copy_with_progress(
        &self,
        src: LogicalPath,
        dest: LogicalPath,
        options: CopyOrMoveOptions,
        progress: ProgressSink,
    ) -> PendingOperation<()> {
        self.transfer(TransferMode::Copy, src, dest, options, Some(progress))
    }

    /// Move a file or directory tree.
    pub fn move_to(
        &self,
        src: LogicalPath,
        dest: LogicalPath,
        options: CopyOrMoveOptions,
    ) -> PendingOperation<()> {
        self.transfer(TransferMode::Move, src, dest, options, None)
    }

    /// Move a file or directory tree, reporting progress to `progress`.
    pub fn move_with_progress(
        &self,
        src: LogicalPath,
        dest: LogicalPath,
        options: CopyOrMoveOptions,
        progress: ProgressSink,
    ) -> PendingOperation<()> {
        self.transfer(TransferMode::Move, src, dest, options, Some(progress))
    }

    fn transfer(
        &self,
        mode: TransferMode,
        src: LogicalPath,
        dest: LogicalPath,
        options: CopyOrMoveOptions,
        progress: Option<ProgressSink>,
    ) -> PendingOperation<()> {
        let kind = match mode {
            TransferMode::Copy => OperationKind::Copy,
            TransferMode::Move => OperationKind::Move,
        };
        let src_backend = match self.resolve_source(&src) {
            Ok(backend) => backend,
            Err(err) => return self.fail(kind, err),
        };

        // Transferring a path onto itself touches nothing.
        let mut request = Request::new(kind, &dest);
        if src != dest {
            request = match mode {
                TransferMode::Copy => request.reads(&src).writes(&dest),
                TransferMode::Move => request.writes(&src).writes(&dest),
            };
        }
        self.launch(request, move |op| async move {
            op.transfer(mode, src_backend, &src, &dest, options, progress)
                .await
        })
    }

    /// Succeeds if `path` is a directory.
    pub fn directory_exists(&self, path: LogicalPath) -> PendingOperation<()> {
        let request = Request::new(OperationKind::DirectoryExists, &path).reads(&path);
        self.launch(request, move |op| async move { op.directory_exists(&path).await })
    }

    /// Succeeds if `path` is a file.
    pub fn file_exists(&self, path: LogicalPath) -> PendingOperation<()> {
        let request = Request::new(OperationKind::FileExists, &path).reads(&path);
        self.launch(request, move |op| async move { op.file_exists(&path).await })
    }

    /// Metadata for `path`.
    pub fn get_metadata(&self, path: LogicalPath) -> PendingOperation<FileInfo> {
        let request = Request::new(OperationKind::GetMetadata, &path).reads(&path);
        self.launch(request, move |op| async move { op.get_metadata(&path).await })
    }

    /// The complete listing of a directory.
    pub fn read_directory(&self, path: LogicalPath) -> PendingOperation<Vec<DirEntry>> {
        let request = Request::new(OperationKind::ReadDirectory, &path).reads(&path);
        self.launch(request, move |op| async move { op.read_directory(&path).await })
    }

    /// Remove a file or directory. Non-empty directories need `recursive`.
    pub fn remove(&self, path: LogicalPath, recursive: bool) -> PendingOperation<()> {
        let request = Request::new(OperationKind::Remove, &path)
            .writes(&path)
            .interruptible(recursive);
        self.launch(request, move |op| async move { op.remove(&path, recursive).await })
    }

    /// Stream `source` into an existing file starting at `offset`.
    pub fn write<R>(&self, path: LogicalPath, offset: u64, source: R) -> PendingOperation<u64>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let request = Request::new(OperationKind::Write, &path).writes(&path);
        self.launch(request, move |op| async move { op.write(&path, offset, source).await })
    }

    /// Set a file's length.
    pub fn truncate(&self, path: LogicalPath, length: u64) -> PendingOperation<()> {
        let request = Request::new(OperationKind::Truncate, &path).writes(&path);
        self.launch(request, move |op| async move { op.truncate(&path, length).await })
    }

    /// Set access and modification times.
    pub fn touch_file(
        &self,
        path: LogicalPath,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> PendingOperation<()> {
        let request = Request::new(OperationKind::TouchFile, &path).writes(&path);
        self.launch(request, move |op| async move {
            op.touch_file(&path, accessed, modified).await
        })
    }

    /// Open a file. Flags that may change the file are quota-gated.
    pub fn open_file(&self, path: LogicalPath, flags: OpenFlags) -> PendingOperation<FileHandle> {
        let mutating = flags.is_mutating();
        let mut request = Request::new(OperationKind::OpenFile, &path).gated(mutating);
        request = if mutating {
            request.writes(&path)
        } else {
            request.reads(&path)
        };
        let quota = self.shared.quota.clone();
        self.launch(request, move |op| async move {
            let (backend, contexts) = op.open_file(&path, flags).await?;
            Ok(FileHandle::new(path, flags, backend, contexts, quota))
        })
    }

    /// A readable snapshot of a file.
    pub fn create_snapshot_file(&self, path: LogicalPath) -> PendingOperation<SnapshotFile> {
        let request = Request::new(OperationKind::CreateSnapshotFile, &path).reads(&path);
        self.launch(request, move |op| async move { op.create_snapshot_file(&path).await })
    }

    /// Import a host file to `dest`.
    pub fn copy_in_foreign_file(
        &self,
        native: impl Into<PathBuf>,
        dest: LogicalPath,
    ) -> PendingOperation<()> {
        let native = native.into();
        let request = Request::new(OperationKind::CopyInForeignFile, &dest).writes(&dest);
        self.launch(request, move |op| async move {
            op.copy_in_foreign_file(native, &dest).await
        })
    }

    /// Remove a file.
    pub fn remove_file(&self, path: LogicalPath) -> PendingOperation<()> {
        let request = Request::new(OperationKind::RemoveFile, &path).writes(&path);
        self.launch(request, move |op| async move { op.remove_file(&path).await })
    }

    /// Remove an empty directory.
    pub fn remove_directory(&self, path: LogicalPath) -> PendingOperation<()> {
        let request = Request::new(OperationKind::RemoveDirectory, &path).writes(&path);
        self.launch(request, move |op| async move { op.remove_directory(&path).await })
    }

    /// Copy one file within a single backend.
    pub fn copy_file_local(
        &self,
        src: LogicalPath,
        dest: LogicalPath,
        options: CopyOrMoveOptions,
        progress: Option<ProgressSink>,
    ) -> PendingOperation<()> {
        if !src.same_scope(&dest) {
            return self.fail(OperationKind::CopyFileLocal, FsError::InvalidOperation);
        }
        let request = Request::new(OperationKind::CopyFileLocal, &dest)
            .reads(&src)
            .writes(&dest);
        self.launch(request, move |op| async move {
            op.copy_file_local(&src, &dest, options, progress).await
        })
    }

    /// Move one file within a single backend.
    pub fn move_file_local(
        &self,
        src: LogicalPath,
        dest: LogicalPath,
        options: CopyOrMoveOptions,
    ) -> PendingOperation<()> {
        if !src.same_scope(&dest) {
            return self.fail(OperationKind::MoveFileLocal, FsError::InvalidOperation);
        }
        let request = Request::new(OperationKind::MoveFileLocal, &dest)
            .writes(&src)
            .writes(&dest);
        self.launch(request, move |op| async move {
            op.move_file_local(&src, &dest, options).await
        })
    }
}
