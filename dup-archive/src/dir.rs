//! Directory-backed archive.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dup_core::{nfc, Archive, Command, EventTx, Lifecycle};

use crate::{executor, scan};

/// One directory tree under a single root, addressed by archive index.
///
/// `scan` runs on a blocking worker (directory walks and hashing are
/// synchronous I/O); `sync` runs as an async task so the copy fan-out can
/// await its bounded writer channels.
pub struct DirArchive {
    root: PathBuf,
    root_str: String,
    idx: usize,
    lifecycle: Arc<Lifecycle>,
    bytes_read: AtomicU64,
}

impl DirArchive {
    pub fn new(root: PathBuf, idx: usize, lifecycle: Arc<Lifecycle>) -> Self {
        let root_str = nfc(&root.to_string_lossy());
        Self {
            root,
            root_str,
            idx,
            lifecycle,
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub(crate) fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Total bytes read from source files by copy commands. One read per
    /// file regardless of destination count; tests assert on this.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::AcqRel);
    }
}

impl Archive for DirArchive {
    fn root(&self) -> String {
        self.root_str.clone()
    }

    fn scan(self: Arc<Self>, events: EventTx) {
        tokio::task::spawn_blocking(move || scan::run(&self, &events));
    }

    fn sync(self: Arc<Self>, commands: Vec<Command>, events: EventTx) {
        tokio::spawn(async move { executor::run(&self, commands, &events).await });
    }
}

/// Join a relative slash-separated archive path onto a root directory.
pub(crate) fn rel_to_abs(root: &Path, rel: &str) -> PathBuf {
    let mut abs = root.to_path_buf();
    abs.extend(rel.split('/'));
    abs
}
