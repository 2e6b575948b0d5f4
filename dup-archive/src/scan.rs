//! Archive scanning: walk, cache lookup, hashing, cache rewrite.

use std::path::Path;

use chrono::{DateTime, SubsecRound, Utc};
use walkdir::WalkDir;

use dup_core::{nfc, ArchiveEvent, EventTx, FileMeta};

use crate::cache;
use crate::dir::{rel_to_abs, DirArchive};
use crate::hash;

/// Blocking scan body. Emits one `FileMetas`, then a `FileHashed` per file
/// the cache could not vouch for, then — walk errors and cancellation
/// included — one `ArchiveHashed`, after rewriting the on-disk cache with
/// everything that now carries a hash.
pub(crate) fn run(archive: &DirArchive, events: &EventTx) {
    let _work = archive.lifecycle().work();
    let root = archive.root_path();
    let idx = archive.idx();

    let cached = cache::load(root).unwrap_or_else(|err| {
        tracing::warn!(root = %root.display(), error = %err, "hash cache unreadable, rescanning from scratch");
        Default::default()
    });

    let mut entries: Vec<(u64, FileMeta)> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        if archive.lifecycle().should_stop() {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let md = match entry.metadata() {
            Ok(md) => md,
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), error = %err, "stat failed, skipping");
                continue;
            }
        };
        if md.len() == 0 {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let mtime = match md.modified() {
            Ok(t) => DateTime::<Utc>::from(t).round_subsecs(0),
            Err(err) => {
                tracing::warn!(path = %entry.path().display(), error = %err, "mtime unavailable, skipping");
                continue;
            }
        };

        let path = nfc(&slash_path(rel));
        let key = cache::file_key(&md, &path);
        let mut meta = FileMeta {
            path,
            size: md.len(),
            mtime,
            hash: String::new(),
        };
        // Trust the cache only when the inode still looks like the same file.
        if let Some(prev) = cached.get(&key) {
            if prev.size == meta.size && prev.mtime == meta.mtime {
                meta.hash = prev.hash.clone();
            }
        }
        entries.push((key, meta));
    }

    let _ = events.send(ArchiveEvent::FileMetas {
        idx,
        metas: entries.iter().map(|(_, meta)| meta.clone()).collect(),
    });

    for (_, meta) in &mut entries {
        if !meta.hash.is_empty() {
            continue;
        }
        if archive.lifecycle().should_stop() {
            break;
        }
        let abs = rel_to_abs(root, &meta.path);
        match hash::hash_file(&abs, meta.size) {
            Ok(digest) => meta.hash = digest,
            Err(err) => {
                // Empty hash: the planner will treat the file as unique.
                tracing::warn!(path = %abs.display(), error = %err, "hashing failed");
            }
        }
        let _ = events.send(ArchiveEvent::FileHashed {
            idx,
            path: meta.path.clone(),
            hash: meta.hash.clone(),
        });
    }

    if let Err(err) = cache::store(root, &entries) {
        tracing::warn!(root = %root.display(), error = %err, "failed to rewrite hash cache");
    }
    let _ = events.send(ArchiveEvent::ArchiveHashed { idx });
}

fn slash_path(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}
