//! Progress reporting types for copy and move operations.

use fileflux_core::LogicalPath;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::OperationKind;

/// A progress event emitted while a copy or move runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyProgress {
    /// A file transfer is starting.
    BeginFile { src: LogicalPath, dest: LogicalPath },
    /// Cumulative bytes transferred for the current file.
    Bytes { src: LogicalPath, bytes: u64 },
    /// A file transfer finished.
    EndFile { src: LogicalPath, dest: LogicalPath },
    /// Every entry below a directory has been transferred.
    EndDirectory { src: LogicalPath, dest: LogicalPath },
}

/// Sending half of a progress channel.
///
/// Reporting never waits: when the receiver falls behind, events are
/// dropped rather than stalling the transfer.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<CopyProgress>,
}

impl ProgressSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CopyProgress>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Report an event.
    pub fn report(&self, event: CopyProgress) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(?event, "progress channel full, dropping event"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Running totals built from a stream of [`CopyProgress`] events.
#[derive(Debug, Clone)]
pub struct OperationProgress {
    /// The kind of operation being tracked.
    pub kind: OperationKind,
    /// Files whose transfer finished.
    pub files_completed: usize,
    /// Directories whose subtree finished.
    pub directories_completed: usize,
    /// Bytes of completed files plus the current file's progress.
    pub bytes_processed: u64,
    /// Total bytes expected (0 if unknown).
    pub bytes_total: u64,
    /// The file currently being transferred.
    pub current_file: Option<LogicalPath>,
    current_bytes: u64,
}

impl OperationProgress {
    /// Create a tracker.
    pub fn new(kind: OperationKind, bytes_total: u64) -> Self {
        Self {
            kind,
            files_completed: 0,
            directories_completed: 0,
            bytes_processed: 0,
            bytes_total,
            current_file: None,
            current_bytes: 0,
        }
    }

    /// Fold one event into the totals.
    pub fn apply(&mut self, event: &CopyProgress) {
        match event {
            CopyProgress::BeginFile { src, .. } => {
                self.current_file = Some(src.clone());
                self.current_bytes = 0;
            }
            CopyProgress::Bytes { bytes, .. } => {
                self.bytes_processed += bytes.saturating_sub(self.current_bytes);
                self.current_bytes = *bytes;
            }
            CopyProgress::EndFile { .. } => {
                self.files_completed += 1;
                self.current_file = None;
                self.current_bytes = 0;
            }
            CopyProgress::EndDirectory { .. } => self.directories_completed += 1,
        }
    }

    /// Get the progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_processed as f64 / self.bytes_total as f64 * 100.0).min(100.0)
        } else {
            0.0
        }
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        let action = match self.kind {
            OperationKind::Move | OperationKind::MoveFileLocal => "Moved",
            _ => "Copied",
        };
        format!(
            "{} {} files in {} directories",
            action, self.files_completed, self.directories_completed
        )
    }
}
