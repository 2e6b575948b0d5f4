//! Dup core library — domain types, the archive collaborator contract, and
//! the process-wide cooperative lifecycle.
//!
//! Public API surface:
//! - [`types`] — file metadata, plan commands, archive events
//! - [`lifecycle`] — stop flag + outstanding-work counter
//! - [`Archive`] — the scan/sync collaborator trait

pub mod lifecycle;
pub mod types;

use std::sync::Arc;

pub use lifecycle::Lifecycle;
pub use types::{backup_dir_name, nfc, ArchiveEvent, Command, FileMeta};

/// Event channel handed to archive workers. Unbounded: producers never
/// block, delivery is reliable and ordered per producer.
pub type EventTx = tokio::sync::mpsc::UnboundedSender<ArchiveEvent>;

/// An archive: one directory tree (or an in-memory stand-in) addressed by a
/// single root, able to scan itself and to execute a plan.
///
/// Both operations start asynchronous work and return immediately; results
/// arrive on the event channel. `scan` must eventually emit exactly one
/// [`ArchiveEvent::ArchiveHashed`]; `sync` must eventually emit exactly one
/// [`ArchiveEvent::Synced`] — on success, failure and cancellation alike.
pub trait Archive: Send + Sync {
    /// Root path (or label) identifying this archive.
    fn root(&self) -> String;

    /// Walk the tree, emit `FileMetas`, hash what the cache cannot vouch
    /// for, then emit `ArchiveHashed`.
    fn scan(self: Arc<Self>, events: EventTx);

    /// Execute a command list in order, then emit `Synced`.
    fn sync(self: Arc<Self>, commands: Vec<Command>, events: EventTx);
}
