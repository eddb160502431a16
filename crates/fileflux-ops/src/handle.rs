//! Handles to files opened through the runner.

use std::sync::Arc;

use fileflux_core::{FsError, FsResult, LogicalPath, OpenFlags};

use crate::backend::StorageBackend;
use crate::context::ContextFactory;
use crate::quota::QuotaGate;

/// An open file.
///
/// Writes draw from the quota allowance reserved when the file was opened,
/// and each write's usage change is reported to the quota gate right away.
pub struct FileHandle {
    path: LogicalPath,
    flags: OpenFlags,
    backend: Arc<dyn StorageBackend>,
    contexts: ContextFactory,
    quota: Arc<dyn QuotaGate>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl FileHandle {
    pub(crate) fn new(
        path: LogicalPath,
        flags: OpenFlags,
        backend: Arc<dyn StorageBackend>,
        contexts: ContextFactory,
        quota: Arc<dyn QuotaGate>,
    ) -> Self {
        Self {
            path,
            flags,
            backend,
            contexts,
            quota,
        }
    }

    pub fn path(&self) -> &LogicalPath {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current file length.
    pub async fn len(&self) -> FsResult<u64> {
        let info = self.backend.get_info(self.contexts.context(), &self.path).await?;
        Ok(info.size)
    }

    /// Whether the file is currently empty.
    pub async fn is_empty(&self) -> FsResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Read up to `len` bytes at `offset`.
    pub async fn read_at(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        if !self.flags.read {
            return Err(FsError::InvalidOperation);
        }
        self.backend
            .read(self.contexts.context(), &self.path, offset, len)
            .await
    }

    /// Write `data` at `offset`, or at the end of the file in append mode.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        if !self.flags.write && !self.flags.append {
            return Err(FsError::InvalidOperation);
        }
        let offset = if self.flags.append {
            self.len().await?
        } else {
            offset
        };
        let result = self
            .backend
            .write(self.contexts.context(), &self.path, offset, data)
            .await;
        self.report_usage();
        result
    }

    /// Persist pending writes.
    pub async fn flush(&self) -> FsResult<()> {
        self.backend.flush(self.contexts.context(), &self.path).await
    }

    fn report_usage(&self) {
        for (scope, delta) in self.contexts.budget().drain_usage() {
            self.quota.record_usage_delta(&scope, delta);
        }
    }
}
