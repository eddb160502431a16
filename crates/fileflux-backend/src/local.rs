//! Local filesystem backend.
//!
//! Serves one storage scope from a directory on the host. Paths that would
//! resolve outside that directory, for instance through a symlink, are
//! refused.

use std::fs::FileTimes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use fileflux_core::{
    CopyOrMoveOptions, DirEntry, DirectoryBatch, FileInfo, FsError, FsResult, LogicalPath,
    OpenDisposition, OpenFlags, SnapshotContents, SnapshotFile,
};
use fileflux_ops::{CopyProgress, OperationContext, ProgressSink, StorageBackend, size_delta};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Local filesystem backend.
///
/// All paths are relative to `root`. For example, if `root` is
/// `/srv/files`, then `temp:/docs/a.txt` maps to `/srv/files/docs/a.txt`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`.
    ///
    /// The root is canonicalized at construction time so symlinked roots
    /// (e.g. macOS `/tmp`) compare correctly.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    /// The host directory backing this scope.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a logical path to a host path inside the root.
    async fn resolve(&self, path: &LogicalPath) -> FsResult<PathBuf> {
        let mut full = self.root.clone();
        for component in path.path.components() {
            full.push(component);
        }

        // The last existing ancestor must still live under the root.
        let mut ancestor = full.as_path();
        while !fs::try_exists(ancestor).await? {
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => return Ok(full),
            }
        }
        let canonical = fs::canonicalize(ancestor).await?;
        if !canonical.starts_with(&self.root) {
            debug!(%path, resolved = %canonical.display(), "path escapes backend root");
            return Err(FsError::InvalidOperation);
        }
        Ok(full)
    }

    fn info_from(meta: &std::fs::Metadata) -> FileInfo {
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if meta.is_dir() {
            FileInfo::directory(modified)
        } else {
            FileInfo::file(meta.len(), modified)
        }
    }

    /// Metadata, or `None` if nothing exists at `full`.
    async fn lookup(full: &Path) -> FsResult<Option<std::fs::Metadata>> {
        match fs::metadata(full).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn require_parent(full: &Path) -> FsResult<()> {
        let Some(parent) = full.parent() else {
            return Ok(());
        };
        match Self::lookup(parent).await? {
            Some(meta) if meta.is_dir() => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }

    /// Existing size of a copy target; directories are refused.
    async fn replaced_size(full: &Path) -> FsResult<Option<u64>> {
        match Self::lookup(full).await? {
            Some(meta) if meta.is_dir() => Err(FsError::InvalidOperation),
            Some(meta) => Ok(Some(meta.len())),
            None => Ok(None),
        }
    }

    async fn set_times(full: &Path, accessed: SystemTime, modified: SystemTime) -> FsResult<()> {
        let file = fs::File::open(full).await?.into_std().await;
        let times = FileTimes::new().set_accessed(accessed).set_modified(modified);
        tokio::task::spawn_blocking(move || file.set_times(times))
            .await
            .map_err(|e| FsError::failed(e.to_string()))??;
        Ok(())
    }

    fn notify_copied(ctx: &OperationContext, dest: &LogicalPath, src: &LogicalPath, replaced: bool) {
        if replaced {
            ctx.observers().notify_modify_file(dest);
        } else {
            ctx.observers().notify_create_file_from(dest, src);
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_file(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        exclusive: bool,
    ) -> FsResult<bool> {
        let full = self.resolve(path).await?;
        match Self::lookup(&full).await? {
            Some(_) if exclusive => return Err(FsError::AlreadyExists),
            Some(meta) if meta.is_dir() => return Err(FsError::NotAFile),
            Some(_) => return Ok(false),
            None => {}
        }
        Self::require_parent(&full).await?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && !exclusive => {
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
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
        let full = self.resolve(path).await?;
        match Self::lookup(&full).await? {
            Some(meta) if meta.is_dir() && !exclusive => return Ok(()),
            Some(_) => return Err(FsError::AlreadyExists),
            None => {}
        }

        if recursive {
            // Collect the missing ancestors so each creation is observed.
            let mut missing = vec![path.clone()];
            let mut current = path.parent();
            while let Some(dir) = current {
                if Self::lookup(&self.resolve(&dir).await?).await?.is_some() {
                    break;
                }
                current = dir.parent();
                missing.push(dir);
            }
            fs::create_dir_all(&full).await?;
            for dir in missing.iter().rev() {
                ctx.observers().notify_create_directory(dir);
            }
        } else {
            Self::require_parent(&full).await?;
            fs::create_dir(&full).await?;
            ctx.observers().notify_create_directory(path);
        }
        Ok(())
    }

    async fn get_info(&self, _ctx: OperationContext, path: &LogicalPath) -> FsResult<FileInfo> {
        let full = self.resolve(path).await?;
        let meta = fs::metadata(&full).await?;
        Ok(Self::info_from(&meta))
    }

    async fn read_directory(
        &self,
        _ctx: OperationContext,
        path: &LogicalPath,
        offset: usize,
        limit: usize,
    ) -> FsResult<DirectoryBatch> {
        let full = self.resolve(path).await?;
        if !fs::metadata(&full).await?.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(if file_type.is_dir() {
                DirEntry::directory(name)
            } else {
                DirEntry::file(name)
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let total = entries.len();
        Ok(DirectoryBatch {
            has_more: offset.saturating_add(limit) < total,
            entries: entries.into_iter().skip(offset).take(limit).collect(),
        })
    }

    async fn delete_file(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<()> {
        let full = self.resolve(path).await?;
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            return Err(FsError::NotAFile);
        }
        fs::remove_file(&full).await?;
        ctx.record_growth(&path.scope, size_delta(0, meta.len())?);
        ctx.observers().notify_remove_file(path);
        Ok(())
    }

    async fn delete_directory(&self, ctx: OperationContext, path: &LogicalPath) -> FsResult<()> {
        let full = self.resolve(path).await?;
        if !fs::metadata(&full).await?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if full == self.root {
            // The root itself stays; only report whether it is empty.
            let mut dir = fs::read_dir(&full).await?;
            return match dir.next_entry().await? {
                Some(_) => Err(FsError::NotEmpty),
                None => Ok(()),
            };
        }
        fs::remove_dir(&full).await?;
        ctx.observers().notify_remove_directory(path);
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
        let src_full = self.resolve(src).await?;
        let dest_full = self.resolve(dest).await?;
        let meta = fs::metadata(&src_full).await?;
        if meta.is_dir() {
            return Err(FsError::NotAFile);
        }
        if src_full == dest_full {
            return Ok(());
        }
        Self::require_parent(&dest_full).await?;
        let replaced = Self::replaced_size(&dest_full).await?;
        let growth = size_delta(meta.len(), replaced.unwrap_or(0))?;
        ctx.ensure_growth(&dest.scope, growth)?;

        let copied = fs::copy(&src_full, &dest_full).await?;
        ctx.record_growth(&dest.scope, growth);
        if options.preserve_last_modified {
            let modified = meta.modified()?;
            Self::set_times(&dest_full, SystemTime::now(), modified).await?;
        }
        if let Some(progress) = progress {
            progress.report(CopyProgress::Bytes {
                src: src.clone(),
                bytes: copied,
            });
        }
        Self::notify_copied(&ctx, dest, src, replaced.is_some());
        Ok(())
    }

    async fn move_file_local(
        &self,
        ctx: OperationContext,
        src: &LogicalPath,
        dest: &LogicalPath,
        options: CopyOrMoveOptions,
    ) -> FsResult<()> {
        let src_full = self.resolve(src).await?;
        let dest_full = self.resolve(dest).await?;
        let meta = fs::metadata(&src_full).await?;
        if meta.is_dir() {
            return Err(FsError::NotAFile);
        }
        if src_full == dest_full {
            return Ok(());
        }
        Self::require_parent(&dest_full).await?;
        let replaced = Self::replaced_size(&dest_full).await?;

        fs::rename(&src_full, &dest_full).await?;
        ctx.record_growth(&dest.scope, size_delta(0, replaced.unwrap_or(0))?);
        if !options.preserve_last_modified {
            let now = SystemTime::now();
            Self::set_times(&dest_full, now, now).await?;
        }
        Self::notify_copied(&ctx, dest, src, replaced.is_some());
        ctx.observers().notify_remove_file(src);
        Ok(())
    }

    async fn copy_in_foreign_file(
        &self,
        ctx: OperationContext,
        native: &Path,
        dest: &LogicalPath,
    ) -> FsResult<()> {
        let dest_full = self.resolve(dest).await?;
        let meta = fs::metadata(native).await?;
        if meta.is_dir() {
            return Err(FsError::NotAFile);
        }
        Self::require_parent(&dest_full).await?;
        let replaced = Self::replaced_size(&dest_full).await?;
        let growth = size_delta(meta.len(), replaced.unwrap_or(0))?;
        ctx.ensure_growth(&dest.scope, growth)?;

        fs::copy(native, &dest_full).await?;
        ctx.record_growth(&dest.scope, growth);
        if replaced.is_some() {
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
        let full = self.resolve(path).await?;
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            return Err(FsError::NotAFile);
        }
        let growth = size_delta(length, meta.len())?;
        ctx.ensure_growth(&path.scope, growth)?;

        let file = fs::OpenOptions::new().write(true).open(&full).await?;
        file.set_len(length).await?;
        ctx.record_growth(&path.scope, growth);
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
        let full = self.resolve(path).await?;
        Self::set_times(&full, accessed, modified).await
    }

    async fn create_or_open(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        flags: OpenFlags,
    ) -> FsResult<FileInfo> {
        let full = self.resolve(path).await?;
        let existing = Self::lookup(&full).await?;
        if existing.as_ref().is_some_and(|meta| meta.is_dir()) {
            return Err(FsError::NotAFile);
        }
        if existing.is_none() && flags.may_create() {
            Self::require_parent(&full).await?;
        }

        let mut options = fs::OpenOptions::new();
        options.read(flags.read || !flags.is_mutating());
        options.write(flags.write || flags.append || flags.may_create() || flags.truncates());
        match flags.disposition {
            OpenDisposition::Open => {}
            OpenDisposition::Create => {
                options.create_new(true);
            }
            OpenDisposition::OpenAlways => {
                options.create(true);
            }
            OpenDisposition::CreateAlways => {
                options.create(true).truncate(true);
            }
            OpenDisposition::OpenTruncated => {
                options.truncate(true);
            }
        }
        let file = options.open(&full).await?;
        let meta = file.metadata().await?;

        match existing {
            None => ctx.observers().notify_create_file(path),
            Some(previous) if flags.truncates() && previous.len() > 0 => {
                ctx.record_growth(&path.scope, size_delta(0, previous.len())?);
                ctx.observers().notify_modify_file(path);
            }
            Some(_) => {}
        }
        Ok(Self::info_from(&meta))
    }

    async fn read(
        &self,
        _ctx: OperationContext,
        path: &LogicalPath,
        offset: u64,
        len: usize,
    ) -> FsResult<Vec<u8>> {
        let full = self.resolve(path).await?;
        let mut file = fs::File::open(&full).await?;
        if file.metadata().await?.is_dir() {
            return Err(FsError::NotAFile);
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn write(
        &self,
        ctx: OperationContext,
        path: &LogicalPath,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize> {
        let full = self.resolve(path).await?;
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            return Err(FsError::NotAFile);
        }
        let end = offset.saturating_add(data.len() as u64);
        let growth = size_delta(end, meta.len())?.max(0);
        ctx.ensure_growth(&path.scope, growth)?;

        let mut file = fs::OpenOptions::new().write(true).open(&full).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        ctx.record_growth(&path.scope, growth);
        ctx.observers().notify_modify_file(path);
        Ok(data.len())
    }

    async fn flush(&self, _ctx: OperationContext, path: &LogicalPath) -> FsResult<()> {
        let full = self.resolve(path).await?;
        let file = fs::OpenOptions::new().write(true).open(&full).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn create_snapshot_file(
        &self,
        _ctx: OperationContext,
        path: &LogicalPath,
    ) -> FsResult<SnapshotFile> {
        let full = self.resolve(path).await?;
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            return Err(FsError::NotAFile);
        }
        Ok(SnapshotFile {
            info: Self::info_from(&meta),
            contents: SnapshotContents::Native(full),
        })
    }
}
