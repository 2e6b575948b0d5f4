//! Event loop and phase machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use dup_core::{Archive, ArchiveEvent, Command, EventTx, FileMeta, Lifecycle};
use dup_planner::CopyPlanInput;

// ---------------------------------------------------------------------------
// Phases and per-archive state
// ---------------------------------------------------------------------------

/// Run-wide phase. Renames in every copy archive complete before the origin
/// starts fanning out writes into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Renaming,
    Copying,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveState {
    Scanning,
    Hashing,
    Hashed,
    Renaming,
    Copying,
    Synced,
}

struct Slot {
    archive: Arc<dyn Archive>,
    root: String,
    state: ArchiveState,
    files: BTreeMap<String, FileMeta>,
    /// The origin's copy plan, parked here between planning and the copy
    /// phase.
    commands: Vec<Command>,
    /// Progress denominators/numerators; meaning changes per phase
    /// (files to hash, renames to run, bytes to copy).
    total: u64,
    done: u64,
    // Totals surviving into the run summary.
    scanned_files: u64,
    hashed_files: u64,
    renames: u64,
    bytes_copied: u64,
}

impl Slot {
    fn new(archive: Arc<dyn Archive>) -> Self {
        let root = archive.root();
        Self {
            archive,
            root,
            state: ArchiveState::Scanning,
            files: BTreeMap::new(),
            commands: Vec::new(),
            total: 0,
            done: 0,
            scanned_files: 0,
            hashed_files: 0,
            renames: 0,
            bytes_copied: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// What one run did, per archive, for the CLI to print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub phase: Phase,
    pub archives: Vec<ArchiveSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub root: String,
    pub scanned_files: u64,
    pub hashed_files: u64,
    pub renames: u64,
    pub bytes_copied: u64,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Drive a full reconciliation run: scan every archive, plan once all are
/// hashed, rename every copy, then fan origin content out. Returns after
/// the lifecycle has drained, so all workers have flushed or cleaned up.
///
/// `archives[0]` is the origin; the rest are copies. `backup` is the run's
/// quarantine tag.
pub async fn run(
    archives: Vec<Arc<dyn Archive>>,
    lifecycle: Arc<Lifecycle>,
    backup: String,
) -> RunSummary {
    let (events, mut event_rx) = mpsc::unbounded_channel();
    let mut engine = Engine::new(archives, Arc::clone(&lifecycle), backup, events);
    if engine.slots.is_empty() {
        return engine.into_summary();
    }
    engine.start_scans();

    loop {
        tokio::select! {
            // Stop always wins over pending events.
            biased;
            _ = lifecycle.stopped() => {
                tracing::info!("stop requested, finishing up");
                engine.phase = Phase::Done;
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                engine.handle(event);
                if engine.phase == Phase::Done {
                    break;
                }
            }
        }
    }

    // Let in-flight workers observe the flag and clean up before reporting.
    lifecycle.request_stop();
    lifecycle.wait_for_idle().await;
    engine.into_summary()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Engine {
    slots: Vec<Slot>,
    lifecycle: Arc<Lifecycle>,
    backup: String,
    phase: Phase,
    syncing_archives: usize,
    events: EventTx,
}

impl Engine {
    fn new(
        archives: Vec<Arc<dyn Archive>>,
        lifecycle: Arc<Lifecycle>,
        backup: String,
        events: EventTx,
    ) -> Self {
        let syncing_archives = archives.len().saturating_sub(1);
        Self {
            slots: archives.into_iter().map(Slot::new).collect(),
            lifecycle,
            backup,
            phase: Phase::Started,
            syncing_archives,
            events,
        }
    }

    fn start_scans(&self) {
        for slot in &self.slots {
            Arc::clone(&slot.archive).scan(self.events.clone());
        }
    }

    fn handle(&mut self, event: ArchiveEvent) {
        if event.idx() >= self.slots.len() {
            tracing::warn!(idx = event.idx(), "event from unknown archive index");
            return;
        }
        match event {
            ArchiveEvent::FileMetas { idx, metas } => {
                let slot = &mut self.slots[idx];
                slot.state = ArchiveState::Hashing;
                slot.scanned_files = metas.len() as u64;
                for meta in metas {
                    if meta.hash.is_empty() {
                        slot.total += 1;
                    }
                    slot.files.insert(meta.path.clone(), meta);
                }
                tracing::info!(
                    root = %slot.root,
                    files = slot.scanned_files,
                    to_hash = slot.total,
                    "scan complete",
                );
            }
            ArchiveEvent::FileHashed { idx, path, hash } => {
                let slot = &mut self.slots[idx];
                if let Some(meta) = slot.files.get_mut(&path) {
                    meta.hash = hash;
                }
                slot.done += 1;
                slot.hashed_files += 1;
            }
            ArchiveEvent::ArchiveHashed { idx } => {
                let slot = &mut self.slots[idx];
                slot.state = ArchiveState::Hashed;
                tracing::info!(root = %slot.root, hashed = slot.hashed_files, "archive hashed");
                if self
                    .slots
                    .iter()
                    .all(|s| s.state == ArchiveState::Hashed)
                {
                    self.plan_and_dispatch();
                }
            }
            ArchiveEvent::RenamingFile { idx, path } => {
                let slot = &mut self.slots[idx];
                slot.done += 1;
                slot.renames += 1;
                tracing::debug!(root = %slot.root, %path, "renaming");
            }
            ArchiveEvent::CopyingFile { idx, path, bytes } => {
                let slot = &mut self.slots[idx];
                slot.done += bytes;
                slot.bytes_copied += bytes;
                tracing::debug!(root = %slot.root, %path, bytes, "copying");
            }
            ArchiveEvent::Synced { idx } => self.handle_synced(idx),
        }
    }

    fn plan_and_dispatch(&mut self) {
        let Some((origin, copies)) = self.slots.split_first_mut() else {
            return;
        };
        let mut inputs: Vec<CopyPlanInput<'_>> = copies
            .iter_mut()
            .map(|slot| CopyPlanInput {
                root: slot.root.as_str(),
                files: &mut slot.files,
            })
            .collect();
        let plans = dup_planner::build_plans(&self.backup, &mut origin.files, &mut inputs);
        drop(inputs);

        origin.commands = plans.origin;
        self.phase = Phase::Renaming;
        tracing::info!(
            copies = copies.len(),
            origin_copies = origin.commands.len(),
            "plans ready, dispatching renames",
        );

        for (slot, commands) in copies.iter_mut().zip(plans.copies) {
            slot.state = ArchiveState::Renaming;
            slot.total = commands.len() as u64;
            slot.done = 0;
            Arc::clone(&slot.archive).sync(commands, self.events.clone());
        }

        // No copies to wait for: go straight to the copy phase.
        if self.syncing_archives == 0 {
            self.dispatch_origin();
        }
    }

    fn handle_synced(&mut self, idx: usize) {
        self.slots[idx].state = ArchiveState::Synced;
        if self.phase == Phase::Copying {
            tracing::info!("copy phase complete");
            self.phase = Phase::Done;
            self.lifecycle.request_stop();
            return;
        }
        self.syncing_archives = self.syncing_archives.saturating_sub(1);
        if self.syncing_archives == 0 {
            self.dispatch_origin();
        }
    }

    fn dispatch_origin(&mut self) {
        self.phase = Phase::Copying;
        let Some(origin) = self.slots.first_mut() else {
            return;
        };
        origin.state = ArchiveState::Copying;
        let commands = std::mem::take(&mut origin.commands);
        origin.total = commands
            .iter()
            .map(|command| match command {
                Command::Copy { path, .. } => origin.files.get(path).map_or(0, |f| f.size),
                Command::Rename { .. } => 0,
            })
            .sum();
        origin.done = 0;
        tracing::info!(
            root = %origin.root,
            files = commands.len(),
            bytes = origin.total,
            "renames done everywhere, dispatching copy fan-out",
        );
        Arc::clone(&origin.archive).sync(commands, self.events.clone());
    }

    fn into_summary(self) -> RunSummary {
        RunSummary {
            phase: self.phase,
            archives: self
                .slots
                .into_iter()
                .map(|slot| ArchiveSummary {
                    root: slot.root,
                    scanned_files: slot.scanned_files,
                    hashed_files: slot.hashed_files,
                    renames: slot.renames,
                    bytes_copied: slot.bytes_copied,
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
