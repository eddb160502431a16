//! Recursive copy and move, within one backend or across two.

use std::sync::Arc;

use async_trait::async_trait;
use fileflux_core::{CopyOrMoveOptions, FsError, FsResult, LogicalPath, OpenFlags};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backend::StorageBackend;
use crate::context::ContextFactory;
use crate::progress::{CopyProgress, ProgressSink};
use crate::remove::remove_recursively;
use crate::traversal::{DirectoryLister, RecursiveTraversal, TraversalStrategy};

/// Whether sources survive the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
}

/// Tuning for one copy or move.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub options: CopyOrMoveOptions,
    pub chunk_size: usize,
    pub page_size: usize,
    pub max_inflight: usize,
    pub progress: Option<ProgressSink>,
}

/// Backends and roots of one transfer.
pub struct TransferEndpoints {
    pub src_backend: Arc<dyn StorageBackend>,
    pub dest_backend: Arc<dyn StorageBackend>,
    pub src: LogicalPath,
    pub dest: LogicalPath,
}

/// Mirrors a source tree into a destination tree.
pub struct CopyOrMoveStrategy {
    mode: TransferMode,
    endpoints: TransferEndpoints,
    settings: TransferSettings,
    contexts: ContextFactory,
    cancel: CancellationToken,
}

impl CopyOrMoveStrategy {
    /// Create a strategy.
    pub fn new(
        mode: TransferMode,
        endpoints: TransferEndpoints,
        settings: TransferSettings,
        contexts: ContextFactory,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mode,
            endpoints,
            settings,
            contexts,
            cancel,
        }
    }

    fn same_backend(&self) -> bool {
        self.endpoints.src.same_scope(&self.endpoints.dest)
    }

    fn report(&self, event: CopyProgress) {
        if let Some(progress) = &self.settings.progress {
            progress.report(event);
        }
    }

    /// The destination path mirroring `src`.
    fn dest_for(&self, src: &LogicalPath) -> FsResult<LogicalPath> {
        src.relative_to(&self.endpoints.src)
            .map(|relative| self.endpoints.dest.join_path(&relative))
            .ok_or_else(|| FsError::failed(format!("{src} is outside {}", self.endpoints.src)))
    }

    async fn transfer_file(&self, src: &LogicalPath, dest: &LogicalPath) -> FsResult<()> {
        let TransferEndpoints {
            src_backend,
            dest_backend,
            ..
        } = &self.endpoints;
        let options = self.settings.options;

        if self.same_backend() {
            return match self.mode {
                TransferMode::Copy => {
                    dest_backend
                        .copy_file_local(
                            self.contexts.context(),
                            src,
                            dest,
                            options,
                            self.settings.progress.as_ref(),
                        )
                        .await
                }
                TransferMode::Move => {
                    dest_backend
                        .move_file_local(self.contexts.context(), src, dest, options)
                        .await
                }
            };
        }

        self.stream_copy(src, dest).await?;
        if self.mode == TransferMode::Move {
            src_backend.delete_file(self.contexts.context(), src).await?;
        }
        Ok(())
    }

    /// Copy a file between backends in chunks.
    async fn stream_copy(&self, src: &LogicalPath, dest: &LogicalPath) -> FsResult<()> {
        let TransferEndpoints {
            src_backend,
            dest_backend,
            ..
        } = &self.endpoints;

        let info = src_backend.get_info(self.contexts.context(), src).await?;
        if info.is_directory {
            return Err(FsError::NotAFile);
        }
        match dest_backend.get_info(self.contexts.context(), dest).await {
            Ok(existing) if existing.is_directory => return Err(FsError::InvalidOperation),
            Ok(_) | Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }

        dest_backend
            .create_or_open(self.contexts.context(), dest, OpenFlags::create_always())
            .await?;

        let mut offset = 0u64;
        while offset < info.size {
            if self.cancel.is_cancelled() {
                return Err(FsError::Aborted);
            }
            let chunk = src_backend
                .read(self.contexts.context(), src, offset, self.settings.chunk_size)
                .await?;
            if chunk.is_empty() {
                break;
            }
            let written = dest_backend
                .write(self.contexts.context(), dest, offset, &chunk)
                .await?;
            offset += written as u64;
            self.report(CopyProgress::Bytes {
                src: src.clone(),
                bytes: offset,
            });
        }
        trace!(%src, %dest, bytes = offset, "stream copy finished");

        if self.settings.options.flush_on_completion {
            dest_backend.flush(self.contexts.context(), dest).await?;
        }
        if self.settings.options.preserve_last_modified {
            dest_backend
                .touch(self.contexts.context(), dest, info.modified, info.modified)
                .await?;
        }
        Ok(())
    }

    /// Make room for the destination root.
    ///
    /// An existing empty directory is replaced, a non-empty one has its
    /// contents removed first, and a file in the way is an error.
    async fn prepare_dest_root(&self) -> FsResult<()> {
        let dest = &self.endpoints.dest;
        let dest_backend = &self.endpoints.dest_backend;
        match dest_backend.delete_directory(self.contexts.context(), dest).await {
            Ok(()) | Err(FsError::NotFound) => Ok(()),
            Err(FsError::NotADirectory) => Err(FsError::InvalidOperation),
            Err(FsError::NotEmpty) => {
                debug!(%dest, "replacing non-empty destination directory");
                remove_recursively(
                    dest_backend.clone(),
                    self.contexts.clone(),
                    dest,
                    self.cancel.clone(),
                    self.settings.page_size,
                    self.settings.max_inflight,
                )
                .await
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl TraversalStrategy for CopyOrMoveStrategy {
    async fn process_file(&self, src: &LogicalPath) -> FsResult<()> {
        let dest = self.dest_for(src)?;
        // Only the root can turn out to be a directory here.
        if *src == self.endpoints.src {
            let info = self
                .endpoints
                .src_backend
                .get_info(self.contexts.context(), src)
                .await?;
            if info.is_directory {
                return Err(FsError::NotAFile);
            }
        }
        self.report(CopyProgress::BeginFile {
            src: src.clone(),
            dest: dest.clone(),
        });
        self.transfer_file(src, &dest).await?;
        self.report(CopyProgress::EndFile {
            src: src.clone(),
            dest,
        });
        Ok(())
    }

    async fn process_directory(&self, src: &LogicalPath) -> FsResult<()> {
        let dest = self.dest_for(src)?;
        if *src == self.endpoints.src {
            self.prepare_dest_root().await?;
        }
        self.endpoints
            .dest_backend
            .create_directory(self.contexts.context(), &dest, false, false)
            .await
    }

    async fn post_process_directory(&self, src: &LogicalPath) -> FsResult<()> {
        let dest = self.dest_for(src)?;
        if self.settings.options.preserve_last_modified {
            let info = self
                .endpoints
                .src_backend
                .get_info(self.contexts.context(), src)
                .await?;
            self.endpoints
                .dest_backend
                .touch(self.contexts.context(), &dest, info.modified, info.modified)
                .await?;
        }
        self.report(CopyProgress::EndDirectory {
            src: src.clone(),
            dest,
        });

        if self.mode == TransferMode::Move {
            match self
                .endpoints
                .src_backend
                .delete_directory(self.contexts.context(), src)
                .await
            {
                Ok(()) | Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Copy or move `endpoints.src` onto `endpoints.dest`.
///
/// Fails with `InvalidOperation` before touching storage when one root lies
/// inside the other. Transferring a path onto itself succeeds immediately.
pub async fn copy_or_move(
    mode: TransferMode,
    endpoints: TransferEndpoints,
    settings: TransferSettings,
    contexts: ContextFactory,
    cancel: CancellationToken,
) -> FsResult<()> {
    let (src, dest) = (endpoints.src.clone(), endpoints.dest.clone());
    if src == dest {
        return Ok(());
    }
    if src.is_ancestor_of(&dest) || dest.is_ancestor_of(&src) {
        return Err(FsError::InvalidOperation);
    }

    debug!(%mode, %src, %dest, "starting transfer");
    let lister = DirectoryLister::new(
        endpoints.src_backend.clone(),
        contexts.clone(),
        settings.page_size,
    );
    let max_inflight = settings.max_inflight;
    let strategy = CopyOrMoveStrategy::new(mode, endpoints, settings, contexts, cancel.clone());
    RecursiveTraversal::new(strategy, lister, cancel)
        .with_max_inflight(max_inflight)
        .run(&src)
        .await
}
