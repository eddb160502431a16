//! Observer interfaces and the set of observers attached to operations.
//!
//! Observers are fire-and-forget: they are called synchronously from the
//! operation that produced the event and must not block.

use std::fmt;
use std::sync::Arc;

use crate::path::LogicalPath;

/// Notified around every write-class operation on a path.
///
/// `on_start_update` and `on_end_update` always come in balanced pairs.
pub trait UpdateObserver: Send + Sync {
    /// A mutating operation is about to touch `path`.
    fn on_start_update(&self, path: &LogicalPath);

    /// The mutating operation on `path` has finished.
    fn on_end_update(&self, path: &LogicalPath);
}

/// Notified when a read-class operation touches a path.
pub trait AccessObserver: Send + Sync {
    /// `path` was read.
    fn on_access(&self, path: &LogicalPath);
}

/// Notified once per logical change to storage. Never fired for reads.
#[allow(unused_variables)]
pub trait ChangeObserver: Send + Sync {
    /// A file was created.
    fn on_create_file(&self, path: &LogicalPath) {}

    /// A file was created as a copy of `src`.
    fn on_create_file_from(&self, path: &LogicalPath, src: &LogicalPath) {}

    /// A file was removed.
    fn on_remove_file(&self, path: &LogicalPath) {}

    /// A file's contents or metadata changed.
    fn on_modify_file(&self, path: &LogicalPath) {}

    /// A directory was created.
    fn on_create_directory(&self, path: &LogicalPath) {}

    /// A directory was removed.
    fn on_remove_directory(&self, path: &LogicalPath) {}
}

/// All observers attached to an engine.
#[derive(Default, Clone)]
pub struct ObserverSet {
    update: Vec<Arc<dyn UpdateObserver>>,
    access: Vec<Arc<dyn AccessObserver>>,
    change: Vec<Arc<dyn ChangeObserver>>,
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("update", &self.update.len())
            .field("access", &self.access.len())
            .field("change", &self.change.len())
            .finish()
    }
}

impl ObserverSet {
    /// An empty observer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an update observer.
    pub fn with_update_observer(mut self, observer: Arc<dyn UpdateObserver>) -> Self {
        self.update.push(observer);
        self
    }

    /// Attach an access observer.
    pub fn with_access_observer(mut self, observer: Arc<dyn AccessObserver>) -> Self {
        self.access.push(observer);
        self
    }

    /// Attach a change observer.
    pub fn with_change_observer(mut self, observer: Arc<dyn ChangeObserver>) -> Self {
        self.change.push(observer);
        self
    }

    /// Whether no observers are attached.
    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.access.is_empty() && self.change.is_empty()
    }

    pub fn notify_start_update(&self, path: &LogicalPath) {
        self.update.iter().for_each(|o| o.on_start_update(path));
    }

    pub fn notify_end_update(&self, path: &LogicalPath) {
        self.update.iter().for_each(|o| o.on_end_update(path));
    }

    pub fn notify_access(&self, path: &LogicalPath) {
        self.access.iter().for_each(|o| o.on_access(path));
    }

    pub fn notify_create_file(&self, path: &LogicalPath) {
        self.change.iter().for_each(|o| o.on_create_file(path));
    }

    pub fn notify_create_file_from(&self, path: &LogicalPath, src: &LogicalPath) {
        self.change.iter().for_each(|o| o.on_create_file_from(path, src));
    }

    pub fn notify_remove_file(&self, path: &LogicalPath) {
        self.change.iter().for_each(|o| o.on_remove_file(path));
    }

    pub fn notify_modify_file(&self, path: &LogicalPath) {
        self.change.iter().for_each(|o| o.on_modify_file(path));
    }

    pub fn notify_create_directory(&self, path: &LogicalPath) {
        self.change.iter().for_each(|o| o.on_create_directory(path));
    }

    pub fn notify_remove_directory(&self, path: &LogicalPath) {
        self.change.iter().for_each(|o| o.on_remove_directory(path));
    }
}
