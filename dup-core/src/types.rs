//! Domain types shared by the scanner, planner and orchestrator.
//!
//! Paths inside an archive are relative, forward-slash separated and
//! NFC-normalised `String`s — they are map keys and wire data, not
//! filesystem handles. Absolute paths stay `PathBuf` at the I/O edges.

use chrono::{DateTime, SecondsFormat, Utc};
use unicode_normalization::UnicodeNormalization;

// ---------------------------------------------------------------------------
// File metadata
// ---------------------------------------------------------------------------

/// Metadata for one regular file inside an archive.
///
/// `hash` is empty until computed; once set it only changes when the planner
/// rewrites `path` during conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Relative path, NFC-normalised, `/`-separated.
    pub path: String,
    /// File size in bytes; zero-byte files are never recorded.
    pub size: u64,
    /// Modification time, UTC, rounded to whole seconds.
    pub mtime: DateTime<Utc>,
    /// Head+tail content hash, URL-safe base64; empty while unhashed.
    pub hash: String,
}

// ---------------------------------------------------------------------------
// Plan commands
// ---------------------------------------------------------------------------

/// One step of a reconciliation plan.
///
/// Copy archives receive only `Rename`s; the origin receives only `Copy`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Move a file within its own archive. Both paths are relative to the
    /// archive root.
    Rename { source_path: String, dest_path: String },
    /// Stream one origin file into every root in `to_roots`, at `path`.
    /// `hash` is carried so destination writers can extend their hash cache
    /// without rehashing.
    Copy {
        path: String,
        hash: String,
        to_roots: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything an archive worker reports back to the orchestrator.
///
/// Per archive the sequence is: one `FileMetas`, zero or more `FileHashed`,
/// one `ArchiveHashed`; then zero or more `RenamingFile`/`CopyingFile` and
/// exactly one `Synced`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    /// Scan finished walking; every file's metadata, hashed where the cache
    /// could vouch for it.
    FileMetas { idx: usize, metas: Vec<FileMeta> },
    /// One file's hash finished computing. `hash` is empty when hashing the
    /// file failed.
    FileHashed {
        idx: usize,
        path: String,
        hash: String,
    },
    /// Scanning and hashing are complete (also emitted on cancellation).
    ArchiveHashed { idx: usize },
    /// A rename command started executing.
    RenamingFile { idx: usize, path: String },
    /// A chunk of `bytes` was read and fanned out for `path`.
    CopyingFile {
        idx: usize,
        path: String,
        bytes: u64,
    },
    /// The command list has been fully processed.
    Synced { idx: usize },
}

impl ArchiveEvent {
    /// Index of the archive that produced this event.
    pub fn idx(&self) -> usize {
        match self {
            ArchiveEvent::FileMetas { idx, .. }
            | ArchiveEvent::FileHashed { idx, .. }
            | ArchiveEvent::ArchiveHashed { idx }
            | ArchiveEvent::RenamingFile { idx, .. }
            | ArchiveEvent::CopyingFile { idx, .. }
            | ArchiveEvent::Synced { idx } => *idx,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// NFC-normalise a path or path fragment.
///
/// Composed vs decomposed form matters on macOS-style filesystems; every
/// path entering the in-memory model goes through here.
pub fn nfc(s: &str) -> String {
    s.nfc().collect()
}

/// Name of the quarantine directory for one run: `~~~<UTC-RFC3339>~~~`.
///
/// Computed once at process start and shared by every plan in that run.
pub fn backup_dir_name(now: DateTime<Utc>) -> String {
    format!("~~~{}~~~", now.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backup_name_is_stable_and_sortable() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 17, 30, 5).unwrap();
        assert_eq!(backup_dir_name(t), "~~~2024-03-09T17:30:05Z~~~");
    }

    #[test]
    fn nfc_composes_decomposed_sequences() {
        // "é" as 'e' + combining acute vs precomposed U+00E9.
        assert_eq!(nfc("Re\u{301}sume\u{301}.txt"), "R\u{e9}sum\u{e9}.txt");
        assert_eq!(nfc("plain/ascii.txt"), "plain/ascii.txt");
    }

    #[test]
    fn event_idx_covers_every_variant() {
        let events = [
            ArchiveEvent::FileMetas { idx: 1, metas: vec![] },
            ArchiveEvent::FileHashed {
                idx: 1,
                path: "a".into(),
                hash: "h".into(),
            },
            ArchiveEvent::ArchiveHashed { idx: 1 },
            ArchiveEvent::RenamingFile { idx: 1, path: "a".into() },
            ArchiveEvent::CopyingFile {
                idx: 1,
                path: "a".into(),
                bytes: 7,
            },
            ArchiveEvent::Synced { idx: 1 },
        ];
        assert!(events.iter().all(|e| e.idx() == 1));
    }
}
