//! Asynchronous filesystem operation engine for fileflux.
//!
//! The [`OperationRunner`] accepts requests against logical paths, resolves
//! the backend for each path's scope, admits mutating requests through a
//! [`QuotaGate`], and runs each request as its own task. Recursive copy,
//! move, and remove are built on [`RecursiveTraversal`], which drives a
//! [`TraversalStrategy`] depth first with bounded per-directory
//! parallelism.

mod backend;
mod context;
mod copy_move;
mod handle;
mod operation;
mod progress;
mod quota;
mod remove;
mod runner;
mod traversal;

pub use backend::{BackendRegistry, StorageBackend};
pub use context::{ContextFactory, OperationContext, QuotaBudget, size_delta};
pub use copy_move::{
    CopyOrMoveStrategy, TransferEndpoints, TransferMode, TransferSettings, copy_or_move,
};
pub use handle::FileHandle;
pub use operation::{Operation, OperationId, OperationKind, OperationState};
pub use progress::{CopyProgress, OperationProgress, ProgressSink};
pub use quota::{MemoryQuota, QuotaError, QuotaGate, UsageAndQuota};
pub use remove::{RemoveStrategy, remove_recursively};
pub use runner::{OperationRunner, OperationStatus, PendingCancel, PendingOperation};
pub use traversal::{DirectoryLister, RecursiveTraversal, TraversalStrategy};
