//! Depth-first tree walking shared by recursive copy, move, and remove.
//!
//! The walk visits a root, then descends directory by directory. For each
//! directory it calls [`TraversalStrategy::process_directory`], lists the
//! children, runs the file callbacks with bounded parallelism, recurses into
//! the subdirectories in listing order, and finally calls
//! [`TraversalStrategy::post_process_directory`] once the whole subtree is
//! done. Pending directories live on an explicit stack, so deep trees do
//! not grow the call stack.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use fileflux_core::{DEFAULT_MAX_INFLIGHT_OPERATIONS, DirEntry, FsError, FsResult, LogicalPath};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backend::StorageBackend;
use crate::context::ContextFactory;

/// Per-entry callbacks driven by [`RecursiveTraversal`].
#[async_trait]
pub trait TraversalStrategy: Send + Sync {
    /// Handle a file. Returning `NotAFile` for the root switches the walk
    /// into directory mode; for any other entry it is an error.
    async fn process_file(&self, path: &LogicalPath) -> FsResult<()>;

    /// Called when entering a directory, before its children are listed.
    async fn process_directory(&self, path: &LogicalPath) -> FsResult<()>;

    /// Called after every entry below the directory has been handled.
    async fn post_process_directory(&self, path: &LogicalPath) -> FsResult<()>;
}

/// Reads complete directory listings page by page.
#[derive(Clone)]
pub struct DirectoryLister {
    backend: Arc<dyn StorageBackend>,
    contexts: ContextFactory,
    page_size: usize,
}

impl DirectoryLister {
    /// Create a lister over `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>, contexts: ContextFactory, page_size: usize) -> Self {
        Self {
            backend,
            contexts,
            page_size: page_size.max(1),
        }
    }

    /// Every entry of `dir`, in backend order.
    pub async fn list(&self, dir: &LogicalPath) -> FsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        loop {
            let batch = self
                .backend
                .read_directory(self.contexts.context(), dir, entries.len(), self.page_size)
                .await?;
            let fetched = batch.entries.len();
            entries.extend(batch.entries);
            if !batch.has_more || fetched == 0 {
                return Ok(entries);
            }
        }
    }
}

/// Walks a tree and drives a [`TraversalStrategy`] over it.
pub struct RecursiveTraversal<S> {
    strategy: S,
    lister: DirectoryLister,
    cancel: CancellationToken,
    max_inflight: usize,
}

impl<S: TraversalStrategy> RecursiveTraversal<S> {
    /// Create a traversal.
    pub fn new(strategy: S, lister: DirectoryLister, cancel: CancellationToken) -> Self {
        Self {
            strategy,
            lister,
            cancel,
            max_inflight: DEFAULT_MAX_INFLIGHT_OPERATIONS,
        }
    }

    /// Cap on concurrently running file callbacks.
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight.max(1);
        self
    }

    /// The strategy being driven.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Walk the tree rooted at `root`.
    ///
    /// Returns the first error raised by any callback, `Aborted` if the walk
    /// was cancelled before an error occurred, or `Ok` once every entry has
    /// been handled.
    pub async fn run(&self, root: &LogicalPath) -> FsResult<()> {
        let result = self.walk(root).await;
        match result {
            Ok(()) if self.cancel.is_cancelled() => Err(FsError::Aborted),
            other => other,
        }
    }

    async fn walk(&self, root: &LogicalPath) -> FsResult<()> {
        match self.strategy.process_file(root).await {
            Err(FsError::NotAFile) => {}
            other => return other,
        }

        // Each frame holds the not yet finished subdirectories of one level.
        // The front of a frame is the directory currently being walked.
        let mut frames: Vec<VecDeque<LogicalPath>> = vec![VecDeque::from([root.clone()])];

        loop {
            let Some(dir) = frames.last().and_then(|frame| frame.front()).cloned() else {
                return Ok(());
            };
            if self.cancel.is_cancelled() {
                return Err(FsError::Aborted);
            }

            self.strategy.process_directory(&dir).await?;

            let mut files = VecDeque::new();
            let mut subdirectories = VecDeque::new();
            for entry in self.lister.list(&dir).await? {
                let child = dir.join(&entry.name);
                if entry.is_directory {
                    subdirectories.push_back(child);
                } else {
                    files.push_back(child);
                }
            }
            trace!(
                %dir,
                files = files.len(),
                subdirectories = subdirectories.len(),
                "entered directory"
            );
            frames.push(subdirectories);

            self.process_files(files).await?;

            // Unwind every level whose subdirectories are exhausted.
            loop {
                if self.cancel.is_cancelled() {
                    return Err(FsError::Aborted);
                }
                if frames.last().is_some_and(|frame| !frame.is_empty()) {
                    break;
                }
                frames.pop();
                let Some(finished) = frames.last_mut().and_then(|frame| frame.pop_front()) else {
                    return Ok(());
                };
                self.strategy.post_process_directory(&finished).await?;
            }
        }
    }

    /// Run file callbacks with at most `max_inflight` outstanding.
    ///
    /// After the first failure no new callbacks start; the ones already
    /// running are drained and their results discarded.
    async fn process_files(&self, mut pending: VecDeque<LogicalPath>) -> FsResult<()> {
        let mut inflight = FuturesUnordered::new();
        let mut first_error: Option<FsError> = None;

        loop {
            while first_error.is_none()
                && inflight.len() < self.max_inflight
                && !self.cancel.is_cancelled()
            {
                let Some(path) = pending.pop_front() else {
                    break;
                };
                let strategy = &self.strategy;
                inflight.push(async move {
                    let result = strategy.process_file(&path).await;
                    (path, result)
                });
            }

            match inflight.next().await {
                None => break,
                Some((_, Ok(()))) => {}
                Some((path, Err(err))) => {
                    if first_error.is_none() {
                        debug!(%path, error = %err, "file callback failed");
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
