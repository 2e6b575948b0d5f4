//! Sync execution: renames, then streaming copies fanned out to N roots.
//!
//! A `Copy` reads its source exactly once. One writer task per destination
//! shares the stream through a one-chunk bounded channel, so the reader
//! advances at the pace of the slowest destination without buffering more
//! than a chunk per writer. Writers finish (or clean up) before the next
//! command starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SubsecRound, Utc};
use filetime::FileTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use dup_core::{ArchiveEvent, Command, EventTx, FileMeta, Lifecycle};

use crate::cache;
use crate::dir::{rel_to_abs, DirArchive};
use crate::hash::CHUNK_SIZE;

pub(crate) async fn run(archive: &Arc<DirArchive>, commands: Vec<Command>, events: &EventTx) {
    let _work = archive.lifecycle().work();
    for command in commands {
        if archive.lifecycle().should_stop() {
            break;
        }
        match command {
            Command::Rename {
                source_path,
                dest_path,
            } => rename_file(archive, &source_path, &dest_path, events).await,
            Command::Copy {
                path,
                hash,
                to_roots,
            } => copy_file(archive, &path, &hash, &to_roots, events).await,
        }
    }
    let _ = events.send(ArchiveEvent::Synced {
        idx: archive.idx(),
    });
}

// ---------------------------------------------------------------------------
// Rename
// ---------------------------------------------------------------------------

async fn rename_file(archive: &DirArchive, source_path: &str, dest_path: &str, events: &EventTx) {
    let _ = events.send(ArchiveEvent::RenamingFile {
        idx: archive.idx(),
        path: source_path.to_string(),
    });

    let from = rel_to_abs(archive.root_path(), source_path);
    let to = rel_to_abs(archive.root_path(), dest_path);

    if let Some(parent) = to.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            tracing::error!(path = %parent.display(), error = %err, "failed to create rename target directory");
            return;
        }
    }
    if let Err(err) = tokio::fs::rename(&from, &to).await {
        tracing::error!(from = %from.display(), to = %to.display(), error = %err, "rename failed");
        return;
    }

    if let Some(parent) = from.parent() {
        if parent != archive.root_path() {
            remove_if_housekeeping_only(parent).await;
        }
    }
}

/// Remove a directory that holds nothing but filesystem droppings
/// (`.DS_Store`, AppleDouble `._*` files).
async fn remove_if_housekeeping_only(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name != ".DS_Store" && !name.starts_with("._") {
            return;
        }
    }
    let _ = tokio::fs::remove_dir_all(dir).await;
}

// ---------------------------------------------------------------------------
// Copy fan-out
// ---------------------------------------------------------------------------

async fn copy_file(
    archive: &Arc<DirArchive>,
    path: &str,
    hash: &str,
    to_roots: &[String],
    events: &EventTx,
) {
    let source = rel_to_abs(archive.root_path(), path);
    let md = match tokio::fs::metadata(&source).await {
        Ok(md) => md,
        Err(err) => {
            tracing::error!(path = %source.display(), error = %err, "cannot stat copy source");
            return;
        }
    };
    let size = md.len();
    let mtime = match md.modified() {
        Ok(t) => t,
        Err(err) => {
            tracing::error!(path = %source.display(), error = %err, "copy source has no mtime");
            return;
        }
    };
    let mut file = match tokio::fs::File::open(&source).await {
        Ok(f) => f,
        Err(err) => {
            tracing::error!(path = %source.display(), error = %err, "cannot open copy source");
            return;
        }
    };

    let mut senders = Vec::with_capacity(to_roots.len());
    let mut writers = Vec::with_capacity(to_roots.len());
    for root in to_roots {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        senders.push(tx);
        writers.push(tokio::spawn(write_destination(
            Arc::clone(archive.lifecycle()),
            PathBuf::from(root),
            path.to_string(),
            hash.to_string(),
            size,
            mtime,
            rx,
        )));
    }

    loop {
        if archive.lifecycle().should_stop() {
            break;
        }
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        match file.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                archive.add_bytes_read(n as u64);
                let chunk = buf.freeze();
                for tx in &senders {
                    // A dead writer only takes its own destination down.
                    let _ = tx.send(chunk.clone()).await;
                }
                let _ = events.send(ArchiveEvent::CopyingFile {
                    idx: archive.idx(),
                    path: path.to_string(),
                    bytes: n as u64,
                });
            }
            Err(err) => {
                tracing::error!(path = %source.display(), error = %err, "read failed mid-copy");
                break;
            }
        }
    }

    // Close the stream, then let every writer finish or clean up before the
    // next command.
    drop(senders);
    for writer in writers {
        let _ = writer.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_destination(
    lifecycle: Arc<Lifecycle>,
    dest_root: PathBuf,
    path: String,
    hash: String,
    size: u64,
    mtime: SystemTime,
    mut chunks: mpsc::Receiver<Bytes>,
) {
    let _work = lifecycle.work();
    let full = rel_to_abs(&dest_root, &path);

    let parent = full.parent().map(Path::to_path_buf);
    if let Some(parent) = &parent {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            tracing::error!(path = %parent.display(), error = %err, "failed to create destination directory");
            return;
        }
    }
    let mut file = match tokio::fs::File::create(&full).await {
        Ok(f) => f,
        Err(err) => {
            tracing::error!(path = %full.display(), error = %err, "failed to create destination file");
            return;
        }
    };

    let mut written: u64 = 0;
    let mut write_failed = false;
    while let Some(chunk) = chunks.recv().await {
        if lifecycle.should_stop() {
            break;
        }
        if let Err(err) = file.write_all(&chunk).await {
            tracing::error!(path = %full.display(), error = %err, "write failed");
            write_failed = true;
            break;
        }
        written += chunk.len() as u64;
    }
    // tokio's File buffers writes internally; settle them before the mtime
    // stamp and the size check.
    if let Err(err) = file.flush().await {
        tracing::error!(path = %full.display(), error = %err, "flush failed");
        write_failed = true;
    }
    drop(file);

    let cancelled = lifecycle.should_stop();
    if write_failed || cancelled || written != size {
        let _ = tokio::fs::remove_file(&full).await;
        if cancelled {
            if let Some(parent) = &parent {
                // Freshly created parent only; a non-empty one refuses.
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
        return;
    }

    if let Err(err) = filetime::set_file_mtime(&full, FileTime::from_system_time(mtime)) {
        tracing::warn!(path = %full.display(), error = %err, "failed to restore mtime");
    }

    match std::fs::metadata(&full) {
        Ok(md) => {
            let meta = FileMeta {
                path: path.clone(),
                size,
                mtime: DateTime::<Utc>::from(mtime).round_subsecs(0),
                hash,
            };
            let key = cache::file_key(&md, &path);
            if let Err(err) = cache::append(&dest_root, key, &meta) {
                tracing::warn!(root = %dest_root.display(), error = %err, "failed to extend destination hash cache");
            }
        }
        Err(err) => {
            tracing::warn!(path = %full.display(), error = %err, "cannot stat written destination");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dup_core::Archive;
    use tempfile::TempDir;

    fn file_archive(root: &TempDir, idx: usize, lc: &Arc<Lifecycle>) -> Arc<DirArchive> {
        Arc::new(DirArchive::new(root.path().to_path_buf(), idx, Arc::clone(lc)))
    }

    async fn sync_and_wait(
        archive: Arc<DirArchive>,
        commands: Vec<Command>,
    ) -> Vec<ArchiveEvent> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        archive.sync(commands, tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, ArchiveEvent::Synced { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn rename_moves_file_and_creates_parents() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("old.txt"), b"contents").unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&root, 1, &lc);
        let events = sync_and_wait(
            archive,
            vec![Command::Rename {
                source_path: "old.txt".into(),
                dest_path: "nested/deeply/new.txt".into(),
            }],
        )
        .await;

        assert!(!root.path().join("old.txt").exists());
        assert_eq!(
            std::fs::read(root.path().join("nested/deeply/new.txt")).unwrap(),
            b"contents"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, ArchiveEvent::RenamingFile { path, .. } if path == "old.txt")));
    }

    #[tokio::test]
    async fn rename_sweeps_directory_left_with_only_housekeeping_files() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("season")).unwrap();
        std::fs::write(root.path().join("season/only.jpg"), b"jpg").unwrap();
        std::fs::write(root.path().join("season/.DS_Store"), b"finder").unwrap();
        std::fs::write(root.path().join("season/._only.jpg"), b"appledouble").unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&root, 1, &lc);
        sync_and_wait(
            archive,
            vec![Command::Rename {
                source_path: "season/only.jpg".into(),
                dest_path: "moved.jpg".into(),
            }],
        )
        .await;

        assert!(root.path().join("moved.jpg").exists());
        assert!(
            !root.path().join("season").exists(),
            "directory with only housekeeping files is removed"
        );
    }

    #[tokio::test]
    async fn rename_keeps_directory_with_real_entries() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("keep")).unwrap();
        std::fs::write(root.path().join("keep/moving.txt"), b"m").unwrap();
        std::fs::write(root.path().join("keep/staying.txt"), b"s").unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&root, 1, &lc);
        sync_and_wait(
            archive,
            vec![Command::Rename {
                source_path: "keep/moving.txt".into(),
                dest_path: "elsewhere.txt".into(),
            }],
        )
        .await;

        assert!(root.path().join("keep/staying.txt").exists());
    }

    #[tokio::test]
    async fn failed_rename_is_skipped_and_sync_continues() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("real.txt"), b"real").unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&root, 1, &lc);
        let events = sync_and_wait(
            archive,
            vec![
                Command::Rename {
                    source_path: "ghost.txt".into(),
                    dest_path: "anywhere.txt".into(),
                },
                Command::Rename {
                    source_path: "real.txt".into(),
                    dest_path: "renamed.txt".into(),
                },
            ],
        )
        .await;

        assert!(root.path().join("renamed.txt").exists());
        assert!(matches!(events.last(), Some(ArchiveEvent::Synced { .. })));
    }

    #[tokio::test]
    async fn copy_fans_out_to_every_destination_with_one_read() {
        let origin = TempDir::new().unwrap();
        let dest_a = TempDir::new().unwrap();
        let dest_b = TempDir::new().unwrap();

        // Several chunks worth of data, not chunk-aligned.
        let body: Vec<u8> = (0..(2 * CHUNK_SIZE + 777)).map(|i| (i % 241) as u8).collect();
        std::fs::create_dir_all(origin.path().join("media")).unwrap();
        std::fs::write(origin.path().join("media/clip.bin"), &body).unwrap();
        // Destinations need a cache file for writers to append to.
        cache::store(dest_a.path(), &[]).unwrap();
        cache::store(dest_b.path(), &[]).unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&origin, 0, &lc);
        let events = sync_and_wait(
            Arc::clone(&archive),
            vec![Command::Copy {
                path: "media/clip.bin".into(),
                hash: "Y2xpcC1oYXNo".into(),
                to_roots: vec![
                    dest_a.path().to_string_lossy().into_owned(),
                    dest_b.path().to_string_lossy().into_owned(),
                ],
            }],
        )
        .await;

        for dest in [&dest_a, &dest_b] {
            assert_eq!(
                std::fs::read(dest.path().join("media/clip.bin")).unwrap(),
                body,
                "destination bytes match source"
            );
            let cached = cache::load(dest.path()).unwrap();
            assert_eq!(cached.len(), 1);
            let entry = cached.values().next().unwrap();
            assert_eq!(entry.path, "media/clip.bin");
            assert_eq!(entry.hash, "Y2xpcC1oYXNo");
        }

        // Source read once regardless of fan-out width.
        assert_eq!(archive.bytes_read(), body.len() as u64);
        let reported: u64 = events
            .iter()
            .filter_map(|e| match e {
                ArchiveEvent::CopyingFile { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .sum();
        assert_eq!(reported, body.len() as u64);
    }

    #[tokio::test]
    async fn copy_restores_source_mtime_on_destinations() {
        let origin = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        std::fs::write(origin.path().join("dated.txt"), b"when").unwrap();
        filetime::set_file_mtime(
            origin.path().join("dated.txt"),
            FileTime::from_unix_time(1_500_000_000, 0),
        )
        .unwrap();
        cache::store(dest.path(), &[]).unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&origin, 0, &lc);
        sync_and_wait(
            archive,
            vec![Command::Copy {
                path: "dated.txt".into(),
                hash: "ZGF0ZWQ".into(),
                to_roots: vec![dest.path().to_string_lossy().into_owned()],
            }],
        )
        .await;

        let md = std::fs::metadata(dest.path().join("dated.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&md).unix_seconds(), 1_500_000_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn one_unwritable_destination_does_not_stop_the_others() {
        use std::os::unix::fs::PermissionsExt;

        let origin = TempDir::new().unwrap();
        let good = TempDir::new().unwrap();
        let bad = TempDir::new().unwrap();
        std::fs::write(origin.path().join("shared.txt"), b"fan out").unwrap();
        cache::store(good.path(), &[]).unwrap();
        std::fs::set_permissions(bad.path(), std::fs::Permissions::from_mode(0o555)).unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&origin, 0, &lc);
        let events = sync_and_wait(
            archive,
            vec![Command::Copy {
                path: "shared.txt".into(),
                hash: "c2hhcmVk".into(),
                to_roots: vec![
                    bad.path().to_string_lossy().into_owned(),
                    good.path().to_string_lossy().into_owned(),
                ],
            }],
        )
        .await;

        assert_eq!(
            std::fs::read(good.path().join("shared.txt")).unwrap(),
            b"fan out"
        );
        assert!(!bad.path().join("shared.txt").exists());
        assert!(matches!(events.last(), Some(ArchiveEvent::Synced { .. })));

        let mut perms = std::fs::metadata(bad.path()).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(bad.path(), perms).unwrap();
    }

    #[tokio::test]
    async fn stop_before_sync_skips_commands_but_still_reports_synced() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("untouched.txt"), b"stay").unwrap();

        let lc = Lifecycle::new();
        lc.request_stop();
        let archive = file_archive(&root, 1, &lc);
        let events = sync_and_wait(
            archive,
            vec![Command::Rename {
                source_path: "untouched.txt".into(),
                dest_path: "moved.txt".into(),
            }],
        )
        .await;

        assert!(root.path().join("untouched.txt").exists());
        assert!(!root.path().join("moved.txt").exists());
        assert_eq!(events.len(), 1, "only Synced");
        assert!(matches!(events[0], ArchiveEvent::Synced { .. }));
        lc.wait_for_idle().await;
    }

    #[tokio::test]
    async fn cancelled_copy_leaves_no_partial_destination() {
        let origin = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let body = vec![7u8; 4 * CHUNK_SIZE];
        std::fs::write(origin.path().join("big.bin"), &body).unwrap();
        cache::store(dest.path(), &[]).unwrap();

        let lc = Lifecycle::new();
        let archive = file_archive(&origin, 0, &lc);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::clone(&archive).sync(
            vec![Command::Copy {
                path: "big.bin".into(),
                hash: "YmlnLWhhc2g".into(),
                to_roots: vec![dest.path().to_string_lossy().into_owned()],
            }],
            tx,
        );

        // Stop as soon as the first chunk is in flight, then drain.
        while let Some(event) = rx.recv().await {
            if matches!(event, ArchiveEvent::CopyingFile { .. }) {
                lc.request_stop();
            }
            if matches!(event, ArchiveEvent::Synced { .. }) {
                break;
            }
        }
        lc.wait_for_idle().await;

        assert!(
            !dest.path().join("big.bin").exists(),
            "partial destination must be removed"
        );
        // Origin side untouched.
        assert_eq!(std::fs::read(origin.path().join("big.bin")).unwrap(), body);
    }
}
