//! Removal of files, empty directories, and whole subtrees.

use std::sync::Arc;

use async_trait::async_trait;
use fileflux_core::{FsError, FsResult, LogicalPath};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::StorageBackend;
use crate::context::ContextFactory;
use crate::traversal::{DirectoryLister, RecursiveTraversal, TraversalStrategy};

/// Deletes entries of one backend.
///
/// As a [`TraversalStrategy`] it removes files as they are visited and
/// directories once they have been emptied.
pub struct RemoveStrategy {
    backend: Arc<dyn StorageBackend>,
    contexts: ContextFactory,
    root: LogicalPath,
}

impl RemoveStrategy {
    /// Create a strategy removing `root` and everything below it.
    pub fn new(backend: Arc<dyn StorageBackend>, contexts: ContextFactory, root: LogicalPath) -> Self {
        Self {
            backend,
            contexts,
            root,
        }
    }

    /// Remove `path` if it is a file or an empty directory.
    ///
    /// A file delete that fails because the target looks like a directory is
    /// retried as a directory delete. If that retry reports the target is
    /// not a directory either, the original file error is returned.
    pub async fn remove_single(&self, path: &LogicalPath) -> FsResult<()> {
        let file_error = match self.backend.delete_file(self.contexts.context(), path).await {
            Ok(()) => return Ok(()),
            Err(err @ (FsError::NotAFile | FsError::InvalidOperation)) => err,
            Err(err) => return Err(err),
        };

        match self.backend.delete_directory(self.contexts.context(), path).await {
            Err(FsError::NotADirectory) => Err(file_error),
            other => other,
        }
    }

    /// Entries below the root may vanish concurrently; the root may not.
    fn tolerate_missing(&self, path: &LogicalPath, result: FsResult<()>) -> FsResult<()> {
        match result {
            Err(FsError::NotFound) if *path != self.root => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl TraversalStrategy for RemoveStrategy {
    async fn process_file(&self, path: &LogicalPath) -> FsResult<()> {
        let result = self.backend.delete_file(self.contexts.context(), path).await;
        self.tolerate_missing(path, result)
    }

    async fn process_directory(&self, _path: &LogicalPath) -> FsResult<()> {
        Ok(())
    }

    async fn post_process_directory(&self, path: &LogicalPath) -> FsResult<()> {
        let result = self.backend.delete_directory(self.contexts.context(), path).await;
        self.tolerate_missing(path, result)
    }
}

/// Remove `path` and its whole subtree.
///
/// The backend's bulk delete is tried first; backends that do not support
/// it get a depth-first walk deleting files first and directories last.
pub async fn remove_recursively(
    backend: Arc<dyn StorageBackend>,
    contexts: ContextFactory,
    path: &LogicalPath,
    cancel: CancellationToken,
    page_size: usize,
    max_inflight: usize,
) -> FsResult<()> {
    match backend.delete_recursively(contexts.context(), path).await {
        Err(FsError::InvalidOperation) => {}
        other => return other,
    }
    debug!(%path, backend = backend.name(), "bulk delete unsupported, walking tree");

    let lister = DirectoryLister::new(backend.clone(), contexts.clone(), page_size);
    let strategy = RemoveStrategy::new(backend, contexts, path.clone());
    RecursiveTraversal::new(strategy, lister, cancel)
        .with_max_inflight(max_inflight)
        .run(path)
        .await
}
