//! In-memory storage backend.
//!
//! Used for sandboxed scopes and for testing. All data is ephemeral.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use fileflux_core::{
    CopyOrMoveOptions, DirEntry, DirectoryBatch, FileInfo, FsError, FsResult, LogicalPath,
    OpenDisposition, OpenFlags, SnapshotContents, SnapshotFile, VirtualPath,
};
use fileflux_ops::{CopyProgress, OperationContext, ProgressSink, StorageBackend, size_delta};
use tracing::trace;

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        accessed: SystemTime,
        modified: SystemTime,
    },
    Directory {
        accessed: SystemTime,
        modified: SystemTime,
    },
}

impl Node {
    fn empty_file() -> Self {
        let now = SystemTime::now();
        Node::File {
            data: Vec::new(),
            accessed: now,
            modified: now,
        }
    }

    fn directory() -> Self {
        let now = SystemTime::now();
        Node::Directory {
            accessed: now,
            modified: now,
        }
    }

    fn is_directory(&self) -> bool {
        matches!(self, Node::Directory { .. })
    }

    fn len(&self) -> u64 {
        match self {
            Node::File { data, .. } => data.len() as u64,
            Node::Directory { .. } => 0,
        }
    }

    fn info(&self) -> FileInfo {
        match self {
            Node::File { data, modified, .. } => FileInfo::file(data.len() as u64, *modified),
            Node::Directory { modified, .. } => FileInfo::directory(*modified),
        }
    }

    fn set_times(&mut self, atime: SystemTime, mtime: SystemTime) {
        match self {
            Node::File {
                accessed, modified, ..
            }
            | Node::Directory { accessed, modified } => {
                *accessed = atime;
                *modified = mtime;
            }
        }
    }
}

type Entries = BTreeMap<VirtualPath, Node>;

/// In-memory storage backend.
///
/// Thread-safe via an internal `RwLock`; the lock is never held across an
/// await point. Listings are sorted by name.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<Entries>,
    faults: RwLock<HashMap<VirtualPath, FsError>>,
    bulk_delete: bool,
    yield_per_call: bool,
    calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty filesystem containing only the root directory.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(VirtualPath::root(), Node::directory());
        Self {
            entries: RwLock::new(entries),
            faults: RwLock::new(HashMap::new()),
            bulk_delete: false,
            yield_per_call: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Support `delete_recursively` natively instead of leaving removal to
    /// a tree walk.
    pub fn with_bulk_delete(mut self, enabled: bool) -> Self {
        self.bulk_delete = enabled;
        self
    }

    /// Yield to the scheduler at the start of every primitive.
    pub fn with_yielding(mut self, enabled: bool) -> Self {
        self.yield_per_call = enabled;
        self
    }

    /// Make every primitive touching `path` fail with `error`.
    pub fn inject_fault(&self, path: &str, error: FsError) {
        if let Ok(mut faults) = self.faults.write() {
            faults.insert(VirtualPath::new(path), error);
        }
    }

    /// Number of primitives invoked so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Create a file with `data`, creating missing parents.
    pub fn insert_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        let path = VirtualPath::new(path);
        if let Ok(mut entries) = self.entries.write() {
            Self::insert_parents(&mut entries, &path);
            let now = SystemTime::now();
            entries.insert(
                path,
                Node::File {
                    data: data.into(),
                    accessed: now,
                    modified: now,
                },
            );
        }
    }

    /// Create a directory, creating missing parents.
    pub fn insert_directory(&self, path: &str) {
        let path = VirtualPath::new(path);
        if let Ok(mut entries) = self.entries.write() {
            Self::insert_parents(&mut entries, &path);
            entries.entry(path).or_insert_with(Node::directory);
        }
    }

    /// Contents of a file, if it exists.
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read().ok()?;
        match entries.get(&VirtualPath::new(path))? {
            Node::File { data, .. } => Some(data.clone()),
            Node::Directory { .. } => None,
        }
    }

    /// Whether an entry exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&VirtualPath::new(path)))
            .unwrap_or(false)
    }

    /// Whether a directory exists at `path`.
    pub fn is_directory(&self, path: &str) -> bool {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&VirtualPath::new(path)).map(Node::is_directory))
            .unwrap_or(false)
    }

    /// Every path except the root, in sorted order.
    pub fn paths(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .keys()
                    .filter(|path| !path.is_root())
                    .map(|path| path.as_str().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total bytes stored in files.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .read()
            .map(|entries| entries.values().map(Node::len).sum())
            .unwrap_or(0)
    }

    fn insert_parents(entries: &mut Entries, path: &VirtualPath) {
        let mut current = path.parent();
        while let Some(dir) = current {
            current = dir.parent();
            entries.entry(dir).or_insert_with(Node::directory);
        }
    }

    async fn enter(&self, paths: &[&VirtualPath]) -> FsResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.yield_per_call {
            tokio::task::yield_now().await;
        }
        let faults = self
            .faults
            .read()
            .map_err(|_| FsError::failed("lock poisoned"))?;
        for path in paths {
            if let Some(err) = faults.get(*path) {
                trace!(%path, error = %err, "injected fault");
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn read_entries(&self) -> FsResult<RwLockReadGuard<'_, Entries>> {
        self.entries
            .read()
            .map_err(|_| FsError::failed("lock poisoned"))
    }

    fn write_entries(&self) -> FsResult<RwLockWriteGuard<'_, Entries>> {
        self.entries
            .write()
            .map_err(|_| FsError::failed("lock poisoned"))
    }

    /// The parent of `path` must exist and be a directory.
    fn check_parent(entries: &Entries, path: &VirtualPath) -> FsResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        match entries.get(&parent) {
            Some(node) if node.is_directory() => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }

    fn children<'a>(
        entries: &'a Entries,
        dir: &'a VirtualPath,
    ) -> impl Iterator<Item = (&'a VirtualPath, &'a Node)> + 'a {
        entries
            .iter()
            .filter(move |(path, _)| !path.is_root() && path.parent().as_ref() == Some(dir))
    }

    fn descendants(entries: &Entries, dir: &VirtualPath) -> Vec<VirtualPath> {
        entries
            .keys()
            .filter(|path| dir.is_ancestor_of(path))
            .cloned()
            .collect()
    }

    /// Write `data` into `dest`, creating or replacing a file.
    ///
    /// `released` is space the caller frees in the destination scope within
    /// the same step, such as the source of a rename. Returns whether `dest`
    /// existed before.
    fn store_file(
        ctx: &OperationContext,
        entries: &mut Entries,
        dest: &LogicalPath,
        data: Vec<u8>,
        modified: SystemTime,
        released: i64,
    ) -> FsResult<bool> {
        Self::check_parent(entries, &dest.path)?;
        let existing = match entries.get(&dest.path) {
            Some(node) if node.is_directory() => return Err(FsError::InvalidOperation),
            Some(node) => Some(node.len()),
            None => None,
        };
        let growth = size_delta(data.len() as u64, existing.unwrap_or(0))?;
        ctx.ensure_growth(&dest.scope, growth.saturating_sub(released))?;
        entries.insert(
            dest.path.clone(),
            Node::File {
                data,
                accessed: SystemTime::now(),
                modified,
            },
        );
        ctx.record_growth(&dest.scope, growth);
        Ok(existing.is_some())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_file(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        exclusive: bool,
    ) -> FsResult<bool> {
        self.enter(&[&path.path]).await?;
        {
            let mut entries = self.write_entries()?;
            match entries.get(&path.path) {
                Some(_) if exclusive => return Err(FsError::AlreadyExists),
                Some(node) if node.is_directory() => return Err(FsError::NotAFile),
                Some(_) => return Ok(false),
                None => {}
            }
            Self::check_parent(&entries, &path.path)?;
            entries.insert(path.path.clone(), Node::empty_file());
        }
        ctx.observers().notify_create_file(path);
        Ok(true)
    }

    async fn create_directory(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        exclusive: bool,
        recursive: bool,
    ) -> FsResult<()> {
        self.enter(&[&path.path]).await?;
        let mut created = Vec::new();
        {
            let mut entries = self.write_entries()?;
            match entries.get(&path.path) {
                Some(node) if node.is_directory() && !exclusive => return Ok(()),
                Some(_) => return Err(FsError::AlreadyExists),
                None => {}
            }

            let mut missing = vec![path.path.clone()];
            let mut current = path.path.parent();
            while let Some(dir) = current {
                match entries.get(&dir) {
                    Some(node) if node.is_directory() => break,
                    Some(_) => return Err(FsError::NotADirectory),
                    None if recursive => {
                        current = dir.parent();
                        missing.push(dir);
                    }
                    None => return Err(FsError::NotFound),
                }
            }

            for dir in missing.into_iter().rev() {
                entries.insert(dir.clone(), Node::directory());
                created.push(dir);
            }
        }
        for dir in created {
            ctx.observers().notify_create_directory(&LogicalPath {
                scope: path.scope.clone(),
                path: dir,
            });
        }
        Ok(())
    }

    async fn get_info(&self, _ctx: OperationContext, path: &LogicalPath) -> FsResult<FileInfo> {
        self.enter(&[&path.path]).await?;
        let entries = self.read_entries()?;
        entries
            .get(&path.path)
            .map(Node::info)
            .ok_or(FsError::NotFound)
    }

    async fn read_directory(
        &self,
        _ctx: OperationContext,
        path: &LogicalPath,
        offset: usize,
        limit: usize,
    ) -> FsResult<DirectoryBatch> {
        self.enter(&[&path.path]).await?;
        let entries = self.read_entries()?;
        match entries.get(&path.path) {
            Some(node) if node.is_directory() => {}
            Some(_) => return Err(FsError::NotADirectory),
            None => return Err(FsError::NotFound),
        }

        let mut children: Vec<DirEntry> = Self::children(&entries, &path.path)
            .filter_map(|(child, node)| {
                let name = child.file_name()?;
                Some(if node.is_directory() {
                    DirEntry::directory(name)
                } else {
                    DirEntry::file(name)
                })
            })
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let total = children.len();
        let page: Vec<DirEntry> = children.into_iter().skip(offset).take(limit).collect();
        Ok(DirectoryBatch {
            has_more: offset.saturating_add(limit) < total,
            entries: page,
        })
    }

    async fn delete_file(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<()> {
        self.enter(&[&path.path]).await?;
        let size = {
            let mut entries = self.write_entries()?;
            match entries.get(&path.path) {
                Some(node) if node.is_directory() => return Err(FsError::NotAFile),
                Some(node) => {
                    let size = node.len();
                    entries.remove(&path.path);
                    size
                }
                None => return Err(FsError::NotFound),
            }
        };
        ctx.record_growth(&path.scope, -(size as i64));
        ctx.observers().notify_remove_file(path);
        Ok(())
    }

    async fn delete_directory(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<()> {
        self.enter(&[&path.path]).await?;
        {
            let mut entries = self.write_entries()?;
            match entries.get(&path.path) {
                Some(node) if !node.is_directory() => return Err(FsError::NotADirectory),
                Some(_) => {}
                None => return Err(FsError::NotFound),
            }
            if Self::children(&entries, &path.path).next().is_some() {
                return Err(FsError::NotEmpty);
            }
            // The root directory always exists.
            if path.path.is_root() {
                return Ok(());
            }
            entries.remove(&path.path);
        }
        ctx.observers().notify_remove_directory(path);
        Ok(())
    }

    async fn delete_recursively(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<()> {
        if !self.bulk_delete {
            return Err(FsError::InvalidOperation);
        }
        self.enter(&[&path.path]).await?;

        let mut removed: Vec<(VirtualPath, Node)> = Vec::new();
        {
            let mut entries = self.write_entries()?;
            let Some(node) = entries.get(&path.path) else {
                return Err(FsError::NotFound);
            };
            let mut doomed = Vec::new();
            if node.is_directory() {
                doomed = Self::descendants(&entries, &path.path);
                // Deepest entries first, so each directory follows its children.
                doomed.sort_by_key(|p| std::cmp::Reverse(p.depth()));
            }
            if !path.path.is_root() {
                doomed.push(path.path.clone());
            }
            for victim in doomed {
                if let Some(node) = entries.remove(&victim) {
                    removed.push((victim, node));
                }
            }
        }

        let freed: u64 = removed.iter().map(|(_, node)| node.len()).sum();
        ctx.record_growth(&path.scope, -(freed as i64));
        for (victim, node) in removed {
            let victim = LogicalPath {
                scope: path.scope.clone(),
                path: victim,
            };
            if node.is_directory() {
                ctx.observers().notify_remove_directory(&victim);
            } else {
                ctx.observers().notify_remove_file(&victim);
            }
        }
        Ok(())
    }

    async fn copy_file_local(
        &self,
        ctx: OperationContext,
        src: &LogicalPath,
        dest: &LogicalPath,
        options: CopyOrMoveOptions,
        progress: Option<&ProgressSink>,
    ) -> FsResult<()> {
        self.enter(&[&src.path, &dest.path]).await?;
        let (size, replaced) = {
            let mut entries = self.write_entries()?;
            let (data, src_modified) = match entries.get(&src.path) {
                Some(Node::File { data, modified, .. }) => (data.clone(), *modified),
                Some(Node::Directory { .. }) => return Err(FsError::NotAFile),
                None => return Err(FsError::NotFound),
            };
            if src.path == dest.path {
                return Ok(());
            }
            let size = data.len() as u64;
            let modified = if options.preserve_last_modified {
                src_modified
            } else {
                SystemTime::now()
            };
            let replaced = Self::store_file(&ctx, &mut entries, dest, data, modified, 0)?;
            (size, replaced)
        };

        if let Some(progress) = progress {
            progress.report(CopyProgress::Bytes {
                src: src.clone(),
                bytes: size,
            });
        }
        if replaced {
            ctx.observers().notify_modify_file(dest);
        } else {
            ctx.observers().notify_create_file_from(dest, src);
        }
        Ok(())
    }

    async fn move_file_local(
        &self,
        ctx: OperationContext,
        src: &LogicalPath,
        dest: &LogicalPath,
        options: CopyOrMoveOptions,
    ) -> FsResult<()> {
        self.enter(&[&src.path, &dest.path]).await?;
        let replaced = {
            let mut entries = self.write_entries()?;
            let (data, src_modified) = match entries.get(&src.path) {
                Some(Node::File { data, modified, .. }) => (data.clone(), *modified),
                Some(Node::Directory { .. }) => return Err(FsError::NotAFile),
                None => return Err(FsError::NotFound),
            };
            if src.path == dest.path {
                return Ok(());
            }
            let size = data.len() as i64;
            let modified = if options.preserve_last_modified {
                src_modified
            } else {
                SystemTime::now()
            };
            // A rename inside one scope does not change its usage.
            let released = if src.scope == dest.scope { size } else { 0 };
            let replaced =
                Self::store_file(&ctx, &mut entries, dest, data, modified, released)?;
            entries.remove(&src.path);
            ctx.record_growth(&src.scope, -size);
            replaced
        };

        if replaced {
            ctx.observers().notify_modify_file(dest);
        } else {
            ctx.observers().notify_create_file_from(dest, src);
        }
        ctx.observers().notify_remove_file(src);
        Ok(())
    }

    async fn copy_in_foreign_file(
        &self,
        ctx: OperationContext,
        native: &Path,
        dest: &LogicalPath,
    ) -> FsResult<()> {
        self.enter(&[&dest.path]).await?;
        let metadata = tokio::fs::metadata(native).await?;
        if metadata.is_dir() {
            return Err(FsError::NotAFile);
        }
        let data = tokio::fs::read(native).await?;
        let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());

        let replaced = {
            let mut entries = self.write_entries()?;
            Self::store_file(&ctx, &mut entries, dest, data, modified, 0)?
        };
        if replaced {
            ctx.observers().notify_modify_file(dest);
        } else {
            ctx.observers().notify_create_file(dest);
        }
        Ok(())
    }

    async fn truncate(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        length: u64,
    ) -> FsResult<()> {
        self.enter(&[&path.path]).await?;
        {
            let mut entries = self.write_entries()?;
            let Some(node) = entries.get_mut(&path.path) else {
                return Err(FsError::NotFound);
            };
            let Node::File { data, modified, .. } = node else {
                return Err(FsError::NotAFile);
            };
            let growth = size_delta(length, data.len() as u64)?;
            ctx.ensure_growth(&path.scope, growth)?;
            let length = usize::try_from(length).map_err(|_| FsError::NoSpace)?;
            if let Some(additional) = length.checked_sub(data.len()) {
                data.try_reserve_exact(additional)
                    .map_err(|_| FsError::NoSpace)?;
            }
            data.resize(length, 0);
            *modified = SystemTime::now();
            ctx.record_growth(&path.scope, growth);
        }
        ctx.observers().notify_modify_file(path);
        Ok(())
    }

    async fn touch(
        &self,
        _ctx: OperationContext,
        path: &LogicalPath,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> FsResult<()> {
        self.enter(&[&path.path]).await?;
        let mut entries = self.write_entries()?;
        let node = entries.get_mut(&path.path).ok_or(FsError::NotFound)?;
        node.set_times(accessed, modified);
        Ok(())
    }

    async fn create_or_open(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        flags: OpenFlags,
    ) -> FsResult<FileInfo> {
        self.enter(&[&path.path]).await?;
        let (info, created, truncated) = {
            let mut entries = self.write_entries()?;
            let existing = entries.get(&path.path).cloned();
            if existing.as_ref().is_some_and(Node::is_directory) {
                return Err(FsError::NotAFile);
            }

            let mut created = false;
            match (&existing, flags.disposition) {
                (Some(_), OpenDisposition::Create) => return Err(FsError::AlreadyExists),
                (None, OpenDisposition::Open | OpenDisposition::OpenTruncated) => {
                    return Err(FsError::NotFound);
                }
                (None, _) => {
                    Self::check_parent(&entries, &path.path)?;
                    entries.insert(path.path.clone(), Node::empty_file());
                    created = true;
                }
                (Some(_), _) => {}
            }

            let mut truncated = 0u64;
            if flags.truncates() {
                if let Some(Node::File { data, modified, .. }) = entries.get_mut(&path.path) {
                    if !data.is_empty() {
                        truncated = data.len() as u64;
                        data.clear();
                        *modified = SystemTime::now();
                    }
                }
            }
            let info = entries
                .get(&path.path)
                .map(Node::info)
                .ok_or(FsError::NotFound)?;
            (info, created, truncated)
        };

        if truncated > 0 {
            ctx.record_growth(&path.scope, -(truncated as i64));
        }
        if created {
            ctx.observers().notify_create_file(path);
        } else if truncated > 0 {
            ctx.observers().notify_modify_file(path);
        }
        Ok(info)
    }

    async fn read(
        &self,
        _ctx: OperationContext,
        path: &LogicalPath,
        offset: u64,
        len: usize,
    ) -> FsResult<Vec<u8>> {
        self.enter(&[&path.path]).await?;
        let entries = self.read_entries()?;
        match entries.get(&path.path) {
            Some(Node::File { data, .. }) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Node::Directory { .. }) => Err(FsError::NotAFile),
            None => Err(FsError::NotFound),
        }
    }

    async fn write(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        offset: u64,
        buf: &[u8],
    ) -> FsResult<usize> {
        self.enter(&[&path.path]).await?;
        {
            let mut entries = self.write_entries()?;
            let Some(node) = entries.get_mut(&path.path) else {
                return Err(FsError::NotFound);
            };
            let Node::File { data, modified, .. } = node else {
                return Err(FsError::NotAFile);
            };

            let start = usize::try_from(offset).map_err(|_| FsError::NoSpace)?;
            let end = start.checked_add(buf.len()).ok_or(FsError::NoSpace)?;
            let growth = size_delta(end as u64, data.len() as u64)?.max(0);
            ctx.ensure_growth(&path.scope, growth)?;

            if end > data.len() {
                data.try_reserve_exact(end - data.len())
                    .map_err(|_| FsError::NoSpace)?;
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
            *modified = SystemTime::now();
            ctx.record_growth(&path.scope, growth);
        }
        ctx.observers().notify_modify_file(path);
        Ok(buf.len())
    }

    async fn create_snapshot_file(
        &self,
        _ctx: OperationContext,
        path: &LogicalPath,
    ) -> FsResult<SnapshotFile> {
        self.enter(&[&path.path]).await?;
        let entries = self.read_entries()?;
        let node = entries.get(&path.path).ok_or(FsError::NotFound)?;
        match node {
            Node::File { data, .. } => Ok(SnapshotFile {
                info: node.info(),
                contents: SnapshotContents::Bytes(data.clone()),
            }),
            Node::Directory { .. } => Err(FsError::NotAFile),
        }
    }
}
