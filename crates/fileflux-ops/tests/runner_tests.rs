mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use fileflux_backend::MemoryBackend;
use fileflux_core::{
    CopyOrMoveOptions, DirEntry, DirectoryBatch, EngineConfig, FileInfo, FsError, FsResult,
    LogicalPath, ObserverSet, OpenFlags, SnapshotContents, SnapshotFile,
};
use fileflux_ops::{
    BackendRegistry, ContextFactory, CopyProgress, MemoryQuota, OperationContext, OperationKind,
    OperationProgress, OperationRunner, OperationStatus, ProgressSink, QuotaGate, RemoveStrategy,
    StorageBackend, TraversalStrategy,
};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use common::{Event, Harness, Recorder, assert_balanced_updates, persistent, temp};

/// Yield until the runner no longer reports `id` as running.
async fn wait_until_finished(runner: &OperationRunner, id: fileflux_ops::OperationId) {
    while runner.status(id) == Some(OperationStatus::Running) {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_create_file_and_metadata() {
    let h = Harness::new();
    h.runner.create_file(temp("a.txt"), true).await.unwrap();

    let info = h.runner.get_metadata(temp("a.txt")).await.unwrap();
    assert!(!info.is_directory);
    assert_eq!(info.size, 0);

    assert_eq!(
        h.runner.create_file(temp("a.txt"), true).await,
        Err(FsError::AlreadyExists)
    );
    h.runner.create_file(temp("a.txt"), false).await.unwrap();
    assert_eq!(
        h.runner.create_file(temp("missing/a.txt"), false).await,
        Err(FsError::NotFound)
    );
}

#[tokio::test]
async fn test_operation_ids_are_unique_and_tracked() {
    let h = Harness::new();
    let first = h.runner.create_directory(temp("a"), false, false);
    let second = h.runner.create_directory(temp("b"), false, false);
    assert_ne!(first.id(), second.id());

    // Nothing has been delivered before the caller awaits.
    assert_eq!(h.runner.status(first.id()), Some(OperationStatus::Running));
    assert_eq!(h.runner.in_flight(), 2);

    first.await.unwrap();
    second.await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(h.runner.in_flight(), 0);
}

#[tokio::test]
async fn test_existence_checks() {
    let h = Harness::new();
    h.temp.insert_file("dir/file", b"1".to_vec());

    h.runner.directory_exists(temp("dir")).await.unwrap();
    h.runner.file_exists(temp("dir/file")).await.unwrap();
    assert_eq!(
        h.runner.directory_exists(temp("dir/file")).await,
        Err(FsError::NotADirectory)
    );
    assert_eq!(h.runner.file_exists(temp("dir")).await, Err(FsError::NotAFile));
    assert_eq!(h.runner.file_exists(temp("nope")).await, Err(FsError::NotFound));
}

#[tokio::test]
async fn test_read_directory_collects_all_pages() {
    let config = EngineConfig::builder().directory_page_size(3usize).build().unwrap();
    let h = Harness::with_config(MemoryBackend::new(), MemoryBackend::new(), config);
    for i in 0..10 {
        h.temp.insert_file(&format!("dir/f{i}"), Vec::new());
    }
    h.temp.insert_directory("dir/sub");

    let entries = h.runner.read_directory(temp("dir")).await.unwrap();
    assert_eq!(entries.len(), 11);
    assert_eq!(entries[0], DirEntry::file("f0"));
    assert_eq!(entries[10], DirEntry::directory("sub"));

    assert_eq!(
        h.runner.read_directory(temp("dir/f0")).await,
        Err(FsError::NotADirectory)
    );
}

#[tokio::test]
async fn test_non_recursive_remove_of_non_empty_directory() {
    let h = Harness::new();
    h.temp.insert_file("dir/file", b"1".to_vec());

    assert_eq!(
        h.runner.remove(temp("dir"), false).await,
        Err(FsError::NotEmpty)
    );
    assert!(h.temp.exists("dir/file"));
    assert!(h.recorder.changes().is_empty());

    h.runner.remove(temp("dir/file"), false).await.unwrap();
    h.runner.remove(temp("dir"), false).await.unwrap();
    assert!(!h.temp.exists("dir"));
    assert_eq!(h.runner.remove(temp("dir"), false).await, Err(FsError::NotFound));
}

#[tokio::test]
async fn test_recursive_remove_falls_back_to_tree_walk() {
    let h = Harness::new();
    for i in 0..8 {
        h.temp.insert_file(&format!("dir/f{i}"), b"12".to_vec());
        h.temp.insert_file(&format!("dir/sub/g{i}"), b"34".to_vec());
    }

    h.runner.remove(temp("dir"), true).await.unwrap();

    assert!(h.temp.paths().is_empty());
    assert_eq!(h.recorder.count(|e| matches!(e, Event::RemoveFile(_))), 16);
    assert_eq!(
        h.recorder.count(|e| matches!(e, Event::RemoveDirectory(_))),
        2
    );
    // The subdirectory goes before its parent.
    let dirs: Vec<Event> = h
        .recorder
        .changes()
        .into_iter()
        .filter(|e| matches!(e, Event::RemoveDirectory(_)))
        .collect();
    assert_eq!(
        dirs,
        vec![
            Event::RemoveDirectory("temp:/dir/sub".into()),
            Event::RemoveDirectory("temp:/dir".into()),
        ]
    );
    assert_eq!(h.quota.usage(&"temp".into()), -32);
}

#[tokio::test]
async fn test_recursive_remove_uses_bulk_delete() {
    let h = Harness::with_backends(MemoryBackend::new().with_bulk_delete(true), MemoryBackend::new());
    for i in 0..8 {
        h.temp.insert_file(&format!("dir/f{i}"), Vec::new());
        h.temp.insert_file(&format!("dir/sub/g{i}"), Vec::new());
    }

    h.runner.remove(temp("dir"), true).await.unwrap();
    assert!(h.temp.paths().is_empty());
    assert_eq!(h.recorder.count(|e| matches!(e, Event::RemoveFile(_))), 16);
    assert_eq!(
        h.recorder.count(|e| matches!(e, Event::RemoveDirectory(_))),
        2
    );
}

#[tokio::test]
async fn test_recursive_remove_of_missing_root() {
    let h = Harness::new();
    assert_eq!(h.runner.remove(temp("ghost"), true).await, Err(FsError::NotFound));
}

#[tokio::test]
async fn test_copy_tree_within_scope() {
    let h = Harness::new();
    h.temp.insert_file("src/a.txt", b"alpha".to_vec());
    h.temp.insert_file("src/nested/b.txt", b"beta".to_vec());
    h.temp.insert_directory("src/empty");

    h.runner
        .copy(temp("src"), temp("dest"), CopyOrMoveOptions::default())
        .await
        .unwrap();

    assert_eq!(h.temp.file_contents("dest/a.txt"), Some(b"alpha".to_vec()));
    assert_eq!(h.temp.file_contents("dest/nested/b.txt"), Some(b"beta".to_vec()));
    assert!(h.temp.is_directory("dest/empty"));
    assert_eq!(h.temp.file_contents("src/a.txt"), Some(b"alpha".to_vec()));
    assert!(h.recorder.events().contains(&Event::CreateFileFrom(
        "temp:/dest/a.txt".into(),
        "temp:/src/a.txt".into()
    )));
}

#[tokio::test]
async fn test_move_tree_within_scope() {
    let h = Harness::new();
    h.temp.insert_file("src/a.txt", b"alpha".to_vec());
    h.temp.insert_file("src/nested/b.txt", b"beta".to_vec());

    h.runner
        .move_to(temp("src"), temp("dest"), CopyOrMoveOptions::default())
        .await
        .unwrap();

    assert!(!h.temp.exists("src"));
    assert_eq!(h.temp.file_contents("dest/nested/b.txt"), Some(b"beta".to_vec()));
}

#[tokio::test]
async fn test_copy_into_own_subtree_is_rejected() {
    let h = Harness::new();
    h.temp.insert_file("a/file", b"1".to_vec());
    h.temp.insert_directory("a/b");
    let before = h.temp.call_count();

    assert_eq!(
        h.runner
            .copy(temp("a"), temp("a/b/c"), CopyOrMoveOptions::default())
            .await,
        Err(FsError::InvalidOperation)
    );
    assert_eq!(
        h.runner
            .move_to(temp("a/b"), temp("a"), CopyOrMoveOptions::default())
            .await,
        Err(FsError::InvalidOperation)
    );
    assert_eq!(h.temp.call_count(), before);
    assert!(h.recorder.changes().is_empty());
}

#[tokio::test]
async fn test_move_onto_itself_is_a_no_op() {
    let h = Harness::new();
    h.temp.insert_file("a/file", b"1".to_vec());
    let before = h.temp.call_count();

    h.runner
        .move_to(temp("a"), temp("a"), CopyOrMoveOptions::default())
        .await
        .unwrap();
    assert_eq!(h.temp.call_count(), before);
    assert!(h.recorder.events().is_empty());
    assert!(h.temp.exists("a/file"));
}

#[tokio::test]
async fn test_copy_replaces_existing_destination_directory() {
    let h = Harness::new();
    h.temp.insert_file("src/new.txt", b"new".to_vec());
    h.temp.insert_file("dest/old.txt", b"old".to_vec());
    h.temp.insert_file("dest/deep/older.txt", b"older".to_vec());

    h.runner
        .copy(temp("src"), temp("dest"), CopyOrMoveOptions::default())
        .await
        .unwrap();

    assert_eq!(h.temp.file_contents("dest/new.txt"), Some(b"new".to_vec()));
    assert!(!h.temp.exists("dest/old.txt"));
    assert!(!h.temp.exists("dest/deep"));
}

#[tokio::test]
async fn test_copy_directory_onto_file_is_rejected() {
    let h = Harness::new();
    h.temp.insert_file("src/a.txt", b"a".to_vec());
    h.temp.insert_file("dest", b"file".to_vec());

    assert_eq!(
        h.runner
            .copy(temp("src"), temp("dest"), CopyOrMoveOptions::default())
            .await,
        Err(FsError::InvalidOperation)
    );
    assert_eq!(h.temp.file_contents("dest"), Some(b"file".to_vec()));
}

#[tokio::test]
async fn test_copy_missing_source() {
    let h = Harness::new();
    assert_eq!(
        h.runner
            .copy(temp("ghost"), temp("dest"), CopyOrMoveOptions::default())
            .await,
        Err(FsError::NotFound)
    );
}

#[tokio::test]
async fn test_cross_scope_copy_streams_with_progress() {
    let config = EngineConfig::builder()
        .stream_copy_chunk_size(4usize)
        .build()
        .unwrap();
    let h = Harness::with_config(MemoryBackend::new(), MemoryBackend::new(), config);
    h.temp.insert_file("src/data.bin", b"0123456789".to_vec());
    h.temp.insert_file("src/sub/small.txt", b"hi".to_vec());
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    h.runner
        .touch_file(temp("src/data.bin"), mtime, mtime)
        .await
        .unwrap();

    let (sink, mut rx) = h.runner.progress_channel();
    h.runner
        .copy_with_progress(
            temp("src"),
            persistent("backup"),
            CopyOrMoveOptions::preserving_last_modified(),
            sink,
        )
        .await
        .unwrap();

    assert_eq!(
        h.persistent.file_contents("backup/data.bin"),
        Some(b"0123456789".to_vec())
    );
    assert_eq!(h.persistent.file_contents("backup/sub/small.txt"), Some(b"hi".to_vec()));
    let info = h.runner.get_metadata(persistent("backup/data.bin")).await.unwrap();
    assert_eq!(info.modified, mtime);

    let mut progress = OperationProgress::new(OperationKind::Copy, 12);
    let mut byte_events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CopyProgress::Bytes { src, bytes } = &event {
            if src.path.as_str() == "src/data.bin" {
                byte_events.push(*bytes);
            }
        }
        progress.apply(&event);
    }
    assert_eq!(byte_events, vec![4, 8, 10]);
    assert_eq!(progress.files_completed, 2);
    assert_eq!(progress.directories_completed, 2);
    assert_eq!(progress.bytes_processed, 12);

    assert_eq!(h.quota.usage(&"persistent".into()), 12);
}

#[tokio::test]
async fn test_cross_scope_move_deletes_sources() {
    let h = Harness::new();
    h.temp.insert_file("src/a.txt", b"abc".to_vec());
    h.temp.insert_file("src/sub/b.txt", b"de".to_vec());

    h.runner
        .move_to(temp("src"), persistent("dest"), CopyOrMoveOptions::default())
        .await
        .unwrap();

    assert!(!h.temp.exists("src"));
    assert_eq!(h.persistent.file_contents("dest/a.txt"), Some(b"abc".to_vec()));
    assert_eq!(h.persistent.file_contents("dest/sub/b.txt"), Some(b"de".to_vec()));
    assert_eq!(h.quota.usage(&"temp".into()), -5);
    assert_eq!(h.quota.usage(&"persistent".into()), 5);
}

#[tokio::test]
async fn test_cross_scope_move_keeps_source_when_copy_fails() {
    let h = Harness::new();
    h.temp.insert_file("src/a.txt", b"abc".to_vec());
    h.persistent.insert_directory("dest");
    h.persistent.inject_fault("dest/a.txt", FsError::failed("write error"));

    assert_eq!(
        h.runner
            .move_to(temp("src"), persistent("dest"), CopyOrMoveOptions::default())
            .await,
        Err(FsError::failed("write error"))
    );
    assert_eq!(h.temp.file_contents("src/a.txt"), Some(b"abc".to_vec()));
}

#[tokio::test]
async fn test_quota_limits_growth() {
    let h = Harness::new();
    h.quota.set_quota("temp", 10);
    h.temp.insert_file("file", Vec::new());

    assert_eq!(h.runner.truncate(temp("file"), 17).await, Err(FsError::NoSpace));
    h.runner.truncate(temp("file"), 10).await.unwrap();
    assert_eq!(h.quota.usage(&"temp".into()), 10);

    assert_eq!(
        h.runner.write(temp("file"), 10, &b"x"[..]).await,
        Err(FsError::NoSpace)
    );
    // Shrinking is always allowed and frees quota.
    h.runner.truncate(temp("file"), 2).await.unwrap();
    assert_eq!(h.quota.usage(&"temp".into()), 2);
    assert_eq!(h.runner.write(temp("file"), 2, &b"abc"[..]).await, Ok(3));
}

#[tokio::test]
async fn test_quota_gate_failure_is_reported_as_failed() {
    let h = Harness::new();
    h.temp.insert_file("file", b"1".to_vec());
    h.quota.fail_lookups(true);
    let before = h.temp.call_count();

    let result = h.runner.create_file(temp("new"), false).await;
    assert!(matches!(result, Err(FsError::Failed(_))));
    assert_eq!(h.temp.call_count(), before);
    assert!(!h.temp.exists("new"));

    // Reads and removals do not consult the gate.
    h.runner.get_metadata(temp("file")).await.unwrap();
    h.runner.remove(temp("file"), false).await.unwrap();
}

#[tokio::test]
async fn test_unknown_scope_is_reported_through_result() {
    let h = Harness::new();
    let pending = h.runner.get_metadata(fileflux_core::LogicalPath::new("nowhere", "x"));
    assert!(matches!(pending.await, Err(FsError::Failed(_))));

    let result = h
        .runner
        .copy(
            fileflux_core::LogicalPath::new("nowhere", "x"),
            temp("y"),
            CopyOrMoveOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(FsError::Failed(_))));
    assert!(h.recorder.events().is_empty());
}

#[tokio::test]
async fn test_update_brackets_are_balanced() {
    let h = Harness::new();
    h.temp.insert_file("dir/a", b"1".to_vec());

    let _ = h.runner.create_file(temp("dir/b"), false).await;
    let _ = h.runner.create_file(temp("missing/b"), false).await;
    let _ = h.runner.remove(temp("dir"), false).await;
    let _ = h
        .runner
        .move_to(temp("dir"), persistent("moved"), CopyOrMoveOptions::default())
        .await;
    let _ = h.runner.truncate(temp("nope"), 3).await;
    tokio::task::yield_now().await;

    let events = h.recorder.events();
    assert_balanced_updates(&events);
    assert!(events.contains(&Event::StartUpdate("temp:/dir".into())));
    assert!(events.contains(&Event::StartUpdate("persistent:/moved".into())));
}

#[tokio::test]
async fn test_reads_notify_access_observers() {
    let h = Harness::new();
    h.temp.insert_file("a", b"1".to_vec());

    h.runner.get_metadata(temp("a")).await.unwrap();
    h.runner.create_snapshot_file(temp("a")).await.unwrap();
    assert_eq!(
        h.recorder.events(),
        vec![Event::Access("temp:/a".into()), Event::Access("temp:/a".into())]
    );
}

#[tokio::test]
async fn test_cancel_unknown_operation() {
    let h = Harness::new();
    let pending = h.runner.create_file(temp("a"), false);
    let id = pending.id();
    pending.await.unwrap();
    wait_until_finished(&h.runner, id).await;

    assert_eq!(h.runner.cancel(id).await, Err(FsError::InvalidOperation));
}

#[tokio::test]
async fn test_cancel_non_interruptible_operation() {
    let h = Harness::new();
    let pending = h.runner.create_file(temp("a"), false);
    assert_eq!(
        h.runner.cancel(pending.id()).await,
        Err(FsError::InvalidOperation)
    );
    pending.await.unwrap();
    assert!(h.temp.exists("a"));
}

#[tokio::test]
async fn test_cancel_copy_aborts() {
    let h = Harness::new();
    h.temp.insert_file("src/a.txt", b"abc".to_vec());

    let pending = h
        .runner
        .copy(temp("src"), temp("dest"), CopyOrMoveOptions::default());
    let cancel = h.runner.cancel(pending.id());

    assert_eq!(pending.await, Err(FsError::Aborted));
    assert_eq!(cancel.await, Ok(()));
    assert!(!h.temp.exists("dest/a.txt"));
}

#[tokio::test]
async fn test_cancel_truncate_completes_primitive() {
    let h = Harness::new();
    h.temp.insert_file("file", b"123456".to_vec());

    let pending = h.runner.truncate(temp("file"), 2);
    let cancel = h.runner.cancel(pending.id());

    assert_eq!(pending.await, Err(FsError::Aborted));
    assert_eq!(cancel.await, Ok(()));
    assert_eq!(h.temp.file_contents("file"), Some(b"12".to_vec()));
}

#[tokio::test]
async fn test_cancel_after_finish() {
    let h = Harness::new();
    h.temp.insert_file("src/a.txt", b"abc".to_vec());

    let pending = h
        .runner
        .copy(temp("src"), temp("dest"), CopyOrMoveOptions::default());
    let id = pending.id();
    wait_until_finished(&h.runner, id).await;

    let cancel = h.runner.cancel(id);
    assert_eq!(pending.await, Ok(()));
    assert_eq!(cancel.await, Err(FsError::InvalidOperation));
    assert_eq!(h.temp.file_contents("dest/a.txt"), Some(b"abc".to_vec()));
}

#[tokio::test]
async fn test_streaming_write() {
    let config = EngineConfig::builder()
        .stream_copy_chunk_size(3usize)
        .build()
        .unwrap();
    let h = Harness::with_config(MemoryBackend::new(), MemoryBackend::new(), config);
    h.temp.insert_file("file", b"0123".to_vec());

    let written = h
        .runner
        .write(temp("file"), 2, &b"abcdefg"[..])
        .await
        .unwrap();
    assert_eq!(written, 7);
    assert_eq!(h.temp.file_contents("file"), Some(b"01abcdefg".to_vec()));

    assert_eq!(
        h.runner.write(temp("missing"), 0, &b"x"[..]).await,
        Err(FsError::NotFound)
    );
}

#[tokio::test]
async fn test_open_file_handle() {
    let h = Harness::new();
    let handle = h
        .runner
        .open_file(temp("f.txt"), OpenFlags::write())
        .await
        .unwrap();
    assert_eq!(handle.write_at(0, b"hello").await, Ok(5));
    assert_eq!(handle.len().await, Ok(5));
    assert_eq!(handle.read_at(0, 5).await, Err(FsError::InvalidOperation));
    assert_eq!(h.quota.usage(&"temp".into()), 5);

    let reader = h
        .runner
        .open_file(temp("f.txt"), OpenFlags::read_only())
        .await
        .unwrap();
    assert_eq!(reader.read_at(1, 3).await, Ok(b"ell".to_vec()));
    assert_eq!(reader.write_at(0, b"x").await, Err(FsError::InvalidOperation));

    assert_eq!(
        h.runner
            .open_file(temp("nope"), OpenFlags::read_only())
            .await
            .map(|_| ()),
        Err(FsError::NotFound)
    );
}

#[tokio::test]
async fn test_snapshot_and_foreign_import() {
    let host = TempDir::new().unwrap();
    let native = host.path().join("import.txt");
    std::fs::write(&native, b"from host").unwrap();

    let h = Harness::new();
    h.runner
        .copy_in_foreign_file(&native, temp("imported.txt"))
        .await
        .unwrap();

    let snapshot = h
        .runner
        .create_snapshot_file(temp("imported.txt"))
        .await
        .unwrap();
    assert_eq!(snapshot.info.size, 9);
    assert_eq!(
        snapshot.contents,
        SnapshotContents::Bytes(b"from host".to_vec())
    );
    assert_eq!(
        h.runner
            .copy_in_foreign_file(host.path().join("absent"), temp("x"))
            .await,
        Err(FsError::NotFound)
    );
}

#[tokio::test]
async fn test_single_file_primitives() {
    let h = Harness::new();
    h.temp.insert_file("a", b"abc".to_vec());
    h.temp.insert_directory("d");

    h.runner
        .copy_file_local(temp("a"), temp("b"), CopyOrMoveOptions::default(), None)
        .await
        .unwrap();
    h.runner
        .move_file_local(temp("b"), temp("d/c"), CopyOrMoveOptions::default())
        .await
        .unwrap();
    assert_eq!(h.temp.file_contents("d/c"), Some(b"abc".to_vec()));
    assert!(!h.temp.exists("b"));

    assert_eq!(
        h.runner
            .copy_file_local(temp("a"), persistent("a"), CopyOrMoveOptions::default(), None)
            .await,
        Err(FsError::InvalidOperation)
    );
    assert_eq!(h.runner.remove_file(temp("d")).await, Err(FsError::NotAFile));
    assert_eq!(h.runner.remove_directory(temp("d")).await, Err(FsError::NotEmpty));
    h.runner.remove_file(temp("d/c")).await.unwrap();
    h.runner.remove_directory(temp("d")).await.unwrap();
}

#[tokio::test]
async fn test_runner_with_defaults() {
    let backend = Arc::new(MemoryBackend::new());
    let registry = BackendRegistry::new().with_backend("temp", backend.clone());
    let runner = OperationRunner::with_defaults(registry);

    runner.create_directory(temp("x/y/z"), true, true).await.unwrap();
    assert!(backend.is_directory("x/y"));
    assert_eq!(
        runner.create_directory(temp("x/y/z"), true, false).await,
        Err(FsError::AlreadyExists)
    );

    let custom = OperationRunner::new(
        BackendRegistry::new().with_backend("temp", backend),
        Arc::new(MemoryQuota::with_default_quota(0)),
        ObserverSet::new(),
        EngineConfig::default(),
    );
    assert_eq!(
        custom.truncate(temp("x/file"), 1).await,
        Err(FsError::NotFound)
    );
}

#[tokio::test]
async fn test_copy_then_move_preserves_tree() {
    let h = Harness::new();
    h.temp.insert_file("src/a", vec![1; 100]);
    h.temp.insert_file("src/b/c", vec![2; 50]);
    h.temp.insert_file("src/b/d/e", vec![3; 7]);
    let files_before = h.temp.paths().len();
    let bytes_before = h.temp.total_bytes();

    h.runner
        .copy(temp("src"), persistent("copy"), CopyOrMoveOptions::default())
        .await
        .unwrap();
    h.runner
        .move_to(persistent("copy"), temp("back"), CopyOrMoveOptions::default())
        .await
        .unwrap();
    h.runner.remove(temp("src"), true).await.unwrap();

    assert_eq!(h.temp.paths().len(), files_before);
    assert_eq!(h.temp.total_bytes(), bytes_before);
    assert_eq!(h.temp.file_contents("back/b/d/e"), Some(vec![3; 7]));
    assert!(h.persistent.paths().is_empty());
}

#[tokio::test]
async fn test_truncate_grow_and_shrink() {
    let h = Harness::new();
    h.runner.create_file(temp("file"), true).await.unwrap();
    h.runner.write(temp("file"), 0, &b"0123456789"[..]).await.unwrap();

    h.runner.truncate(temp("file"), 17).await.unwrap();
    assert_eq!(
        h.temp.file_contents("file"),
        Some(b"0123456789\0\0\0\0\0\0\0".to_vec())
    );
    h.runner.truncate(temp("file"), 3).await.unwrap();
    assert_eq!(h.temp.file_contents("file"), Some(b"012".to_vec()));
    assert_eq!(h.runner.get_metadata(temp("file")).await.unwrap().size, 3);

    assert_eq!(h.quota.usage(&"temp".into()), 3);
    assert_eq!(
        h.recorder.changes(),
        vec![
            Event::CreateFile("temp:/file".into()),
            Event::ModifyFile("temp:/file".into()),
            Event::ModifyFile("temp:/file".into()),
            Event::ModifyFile("temp:/file".into()),
        ]
    );
}

#[tokio::test]
async fn test_truncate_beyond_i64_is_no_space() {
    let h = Harness::new();
    h.temp.insert_file("file", b"0123456789".to_vec());

    assert_eq!(
        h.runner.truncate(temp("file"), u64::MAX).await,
        Err(FsError::NoSpace)
    );
    tokio::task::yield_now().await;
    assert_eq!(h.temp.file_contents("file"), Some(b"0123456789".to_vec()));
    assert_eq!(h.quota.usage(&"temp".into()), 0);
    assert_eq!(h.runner.in_flight(), 0);
}

#[tokio::test]
async fn test_move_within_scope_at_full_quota() {
    let h = Harness::new();
    h.quota.set_quota("temp", 10);
    h.quota.record_usage_delta(&"temp".into(), 10);
    h.temp.insert_file("a", b"0123456789".to_vec());

    h.runner
        .move_file_local(temp("a"), temp("b"), CopyOrMoveOptions::default())
        .await
        .unwrap();
    h.runner
        .move_to(temp("b"), temp("c"), CopyOrMoveOptions::default())
        .await
        .unwrap();

    assert!(!h.temp.exists("a"));
    assert!(!h.temp.exists("b"));
    assert_eq!(h.temp.file_contents("c"), Some(b"0123456789".to_vec()));
    assert_eq!(h.quota.usage(&"temp".into()), 10);
}

#[tokio::test]
async fn test_cancel_recursive_remove_mid_walk() {
    let h = Harness::with_backends(MemoryBackend::new().with_yielding(true), MemoryBackend::new());
    for i in 0..32 {
        h.temp.insert_file(&format!("dir/f{i}"), b"1".to_vec());
        h.temp.insert_file(&format!("dir/sub/g{i}"), b"2".to_vec());
    }

    let pending = h.runner.remove(temp("dir"), true);
    while h.recorder.count(|e| matches!(e, Event::RemoveFile(_))) == 0 {
        tokio::task::yield_now().await;
    }
    let cancel = h.runner.cancel(pending.id());

    assert_eq!(pending.await, Err(FsError::Aborted));
    assert_eq!(cancel.await, Ok(()));
    assert!(h.temp.exists("dir"));
    assert_balanced_updates(&h.recorder.events());
    assert_eq!(h.runner.in_flight(), 0);
}

#[tokio::test]
async fn test_cancel_streaming_write_mid_stream() {
    let config = EngineConfig::builder()
        .stream_copy_chunk_size(3usize)
        .build()
        .unwrap();
    let h = Harness::with_config(
        MemoryBackend::new().with_yielding(true),
        MemoryBackend::new(),
        config,
    );
    h.temp.insert_file("file", Vec::new());
    let (mut tx, rx) = tokio::io::duplex(64);
    tx.write_all(b"abcde").await.unwrap();

    let pending = h.runner.write(temp("file"), 0, rx);
    while h.temp.file_contents("file") != Some(b"abcde".to_vec()) {
        tokio::task::yield_now().await;
    }
    let cancel = h.runner.cancel(pending.id());
    drop(tx);

    assert_eq!(pending.await, Err(FsError::Aborted));
    assert_eq!(cancel.await, Ok(()));
    assert_eq!(h.temp.file_contents("file"), Some(b"abcde".to_vec()));
    assert_balanced_updates(&h.recorder.events());
}

/// Backend whose every primitive panics.
struct PanickingBackend;

#[async_trait]
impl StorageBackend for PanickingBackend {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn create_file(&self, _: OperationContext, _: &LogicalPath, _: bool) -> FsResult<bool> {
        panic!("create_file")
    }

    async fn create_directory(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: bool,
        _: bool,
    ) -> FsResult<()> {
        panic!("create_directory")
    }

    async fn get_info(&self, _: OperationContext, _: &LogicalPath) -> FsResult<FileInfo> {
        panic!("get_info")
    }

    async fn read_directory(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: usize,
        _: usize,
    ) -> FsResult<DirectoryBatch> {
        panic!("read_directory")
    }

    async fn delete_file(&self, _: OperationContext, _: &LogicalPath) -> FsResult<()> {
        panic!("delete_file")
    }

    async fn delete_directory(&self, _: OperationContext, _: &LogicalPath) -> FsResult<()> {
        panic!("delete_directory")
    }

    async fn copy_file_local(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: &LogicalPath,
        _: CopyOrMoveOptions,
        _: Option<&ProgressSink>,
    ) -> FsResult<()> {
        panic!("copy_file_local")
    }

    async fn move_file_local(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: &LogicalPath,
        _: CopyOrMoveOptions,
    ) -> FsResult<()> {
        panic!("move_file_local")
    }

    async fn copy_in_foreign_file(
        &self,
        _: OperationContext,
        _: &Path,
        _: &LogicalPath,
    ) -> FsResult<()> {
        panic!("copy_in_foreign_file")
    }

    async fn truncate(&self, _: OperationContext, _: &LogicalPath, _: u64) -> FsResult<()> {
        panic!("truncate")
    }

    async fn touch(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: SystemTime,
        _: SystemTime,
    ) -> FsResult<()> {
        panic!("touch")
    }

    async fn create_or_open(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: OpenFlags,
    ) -> FsResult<FileInfo> {
        panic!("create_or_open")
    }

    async fn read(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: u64,
        _: usize,
    ) -> FsResult<Vec<u8>> {
        panic!("read")
    }

    async fn write(
        &self,
        _: OperationContext,
        _: &LogicalPath,
        _: u64,
        _: &[u8],
    ) -> FsResult<usize> {
        panic!("write")
    }

    async fn create_snapshot_file(
        &self,
        _: OperationContext,
        _: &LogicalPath,
    ) -> FsResult<SnapshotFile> {
        panic!("create_snapshot_file")
    }
}

#[tokio::test]
async fn test_panicking_primitive_still_completes_operation() {
    let recorder = Arc::new(Recorder::default());
    let runner = OperationRunner::new(
        BackendRegistry::new().with_backend("temp", Arc::new(PanickingBackend)),
        Arc::new(MemoryQuota::unlimited()),
        ObserverSet::new().with_update_observer(recorder.clone()),
        EngineConfig::default(),
    );

    let pending = runner.truncate(temp("file"), 4);
    let id = pending.id();
    let cancel = runner.cancel(id);

    assert!(matches!(pending.await, Err(FsError::Failed(_))));
    assert_eq!(cancel.await, Err(FsError::InvalidOperation));
    assert_eq!(runner.in_flight(), 0);
    assert_eq!(runner.status(id), None);
    assert_eq!(
        recorder.events(),
        vec![
            Event::StartUpdate("temp:/file".into()),
            Event::EndUpdate("temp:/file".into()),
        ]
    );

    // Later operations are unaffected.
    let result = runner.remove(temp("dir"), true).await;
    assert!(matches!(result, Err(FsError::Failed(_))));
    tokio::task::yield_now().await;
    assert_balanced_updates(&recorder.events());
}

#[tokio::test]
async fn test_remove_walk_tolerates_vanished_entries() {
    let h = Harness::new();
    h.temp.insert_directory("dir");
    let backend: Arc<dyn StorageBackend> = h.temp.clone();
    let strategy = RemoveStrategy::new(backend, ContextFactory::ungated(Arc::default()), temp("dir"));

    strategy.process_file(&temp("dir/gone")).await.unwrap();
    strategy.post_process_directory(&temp("dir/gone-too")).await.unwrap();
    strategy.post_process_directory(&temp("dir")).await.unwrap();
    assert_eq!(
        strategy.post_process_directory(&temp("dir")).await,
        Err(FsError::NotFound)
    );
}
