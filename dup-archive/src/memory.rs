//! In-memory archive for simulation runs and orchestrator tests.
//!
//! Replays the real event contract — `FileMetas`, `FileHashed` per
//! unhashed file, `ArchiveHashed`, then `RenamingFile`/`CopyingFile` and
//! `Synced` — against a map instead of a filesystem. `Copy` commands land
//! in linked peer archives, so a full reconciliation round can run without
//! touching disk. Command lists handed to `sync` are recorded for
//! inspection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, SubsecRound, Utc};

use dup_core::{Archive, ArchiveEvent, Command, EventTx, FileMeta, Lifecycle};

/// Contents of one in-memory file: identity only, no bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFile {
    pub size: u64,
    pub hash: String,
}

pub struct MemoryArchive {
    root: String,
    idx: usize,
    lifecycle: Arc<Lifecycle>,
    mtime: DateTime<Utc>,
    files: Mutex<BTreeMap<String, MemoryFile>>,
    prehashed: Mutex<BTreeSet<String>>,
    received: Mutex<Vec<Vec<Command>>>,
    peers: Mutex<HashMap<String, Weak<MemoryArchive>>>,
}

impl MemoryArchive {
    pub fn new(root: impl Into<String>, idx: usize, lifecycle: Arc<Lifecycle>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            idx,
            lifecycle,
            mtime: Utc::now().round_subsecs(0),
            files: Mutex::new(BTreeMap::new()),
            prehashed: Mutex::new(BTreeSet::new()),
            received: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Seed one file.
    pub fn insert(&self, path: &str, size: u64, hash: &str) {
        self.files.lock().expect("files lock").insert(
            path.to_string(),
            MemoryFile {
                size,
                hash: hash.to_string(),
            },
        );
    }

    /// Mark a seeded file as already known to the hash cache: its meta will
    /// carry the hash up front and no `FileHashed` event is emitted for it.
    pub fn mark_prehashed(&self, path: &str) {
        self.prehashed
            .lock()
            .expect("prehashed lock")
            .insert(path.to_string());
    }

    /// Let every archive in `group` resolve every other by root, so `Copy`
    /// commands can deliver into their maps.
    pub fn link(group: &[Arc<MemoryArchive>]) {
        for archive in group {
            let mut peers = archive.peers.lock().expect("peers lock");
            for other in group {
                peers.insert(other.root.clone(), Arc::downgrade(other));
            }
        }
    }

    /// Snapshot of the current file map.
    pub fn files(&self) -> BTreeMap<String, MemoryFile> {
        self.files.lock().expect("files lock").clone()
    }

    /// Every command list this archive's `sync` has received, in order.
    pub fn commands(&self) -> Vec<Vec<Command>> {
        self.received.lock().expect("received lock").clone()
    }

    fn apply_rename(&self, source_path: &str, dest_path: &str) {
        let mut files = self.files.lock().expect("files lock");
        if let Some(meta) = files.remove(source_path) {
            files.insert(dest_path.to_string(), meta);
        }
    }

    fn deliver(&self, root: &str, path: &str, file: MemoryFile) {
        let peer = self.peers.lock().expect("peers lock").get(root).cloned();
        if let Some(peer) = peer.and_then(|weak| weak.upgrade()) {
            peer.files
                .lock()
                .expect("files lock")
                .insert(path.to_string(), file);
        }
    }
}

impl Archive for MemoryArchive {
    fn root(&self) -> String {
        self.root.clone()
    }

    fn scan(self: Arc<Self>, events: EventTx) {
        tokio::spawn(async move {
            let _work = self.lifecycle.work();
            let prehashed = self.prehashed.lock().expect("prehashed lock").clone();
            let snapshot = self.files();

            let metas: Vec<FileMeta> = snapshot
                .iter()
                .map(|(path, file)| FileMeta {
                    path: path.clone(),
                    size: file.size,
                    mtime: self.mtime,
                    hash: if prehashed.contains(path) {
                        file.hash.clone()
                    } else {
                        String::new()
                    },
                })
                .collect();
            let _ = events.send(ArchiveEvent::FileMetas {
                idx: self.idx,
                metas,
            });

            for (path, file) in &snapshot {
                if prehashed.contains(path) {
                    continue;
                }
                if self.lifecycle.should_stop() {
                    break;
                }
                let _ = events.send(ArchiveEvent::FileHashed {
                    idx: self.idx,
                    path: path.clone(),
                    hash: file.hash.clone(),
                });
            }

            let _ = events.send(ArchiveEvent::ArchiveHashed { idx: self.idx });
        });
    }

    fn sync(self: Arc<Self>, commands: Vec<Command>, events: EventTx) {
        tokio::spawn(async move {
            let _work = self.lifecycle.work();
            self.received
                .lock()
                .expect("received lock")
                .push(commands.clone());

            for command in commands {
                if self.lifecycle.should_stop() {
                    break;
                }
                match command {
                    Command::Rename {
                        source_path,
                        dest_path,
                    } => {
                        let _ = events.send(ArchiveEvent::RenamingFile {
                            idx: self.idx,
                            path: source_path.clone(),
                        });
                        self.apply_rename(&source_path, &dest_path);
                    }
                    Command::Copy {
                        path,
                        hash,
                        to_roots,
                    } => {
                        let size = self
                            .files
                            .lock()
                            .expect("files lock")
                            .get(&path)
                            .map(|f| f.size)
                            .unwrap_or(0);
                        for root in &to_roots {
                            self.deliver(
                                root,
                                &path,
                                MemoryFile {
                                    size,
                                    hash: hash.clone(),
                                },
                            );
                        }
                        let _ = events.send(ArchiveEvent::CopyingFile {
                            idx: self.idx,
                            path: path.clone(),
                            bytes: size,
                        });
                    }
                }
            }

            let _ = events.send(ArchiveEvent::Synced { idx: self.idx });
        });
    }
}
