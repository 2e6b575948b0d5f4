//! Hash cache — inode-keyed persistence that lets rescans skip rehashing.
//!
//! Lives at `<root>/.meta.csv`, UTF-8 CSV with header
//! `INode,Name,Size,ModTime,Hash`. The scan reads it once at start and
//! atomically rewrites it at the end (same `.tmp` + rename pattern used
//! everywhere in this workspace); copy writers append one row per
//! successfully written destination. An entry is trusted only when its
//! stored size and mtime match the file currently behind that inode.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use dup_core::FileMeta;

use crate::error::{io_err, ArchiveError};

/// Cache file name inside every archive root. Starts with a dot, so the
/// scanner never records the cache itself.
pub const CACHE_FILE_NAME: &str = ".meta.csv";

#[derive(Debug, Serialize, Deserialize)]
struct CacheRow {
    #[serde(rename = "INode")]
    inode: u64,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "ModTime")]
    mod_time: String,
    #[serde(rename = "Hash")]
    hash: String,
}

/// Path of the cache file for an archive root.
pub fn cache_path(root: &Path) -> PathBuf {
    root.join(CACHE_FILE_NAME)
}

/// Load the cache for `root`. Missing file means an empty cache; rows with
/// unparseable fields or an empty hash are silently dropped.
pub fn load(root: &Path) -> Result<HashMap<u64, FileMeta>, ArchiveError> {
    let path = cache_path(root);
    let mut entries = HashMap::new();
    if !path.exists() {
        return Ok(entries);
    }

    let mut reader = csv::Reader::from_path(&path)?;
    for row in reader.deserialize::<CacheRow>() {
        let Ok(row) = row else { continue };
        if row.hash.is_empty() {
            continue;
        }
        let Ok(mod_time) = DateTime::parse_from_rfc3339(&row.mod_time) else {
            continue;
        };
        entries.insert(
            row.inode,
            FileMeta {
                path: row.name,
                size: row.size,
                mtime: mod_time.with_timezone(&Utc).round_subsecs(0),
                hash: row.hash,
            },
        );
    }
    Ok(entries)
}

/// Atomically rewrite the cache for `root`, keeping only entries that carry
/// a hash. Always writes the header, even for an empty archive, so that
/// later appends have a file to extend.
pub fn store(root: &Path, entries: &[(u64, FileMeta)]) -> Result<(), ArchiveError> {
    let path = cache_path(root);
    let tmp = path.with_extension("csv.tmp");

    // Write the header explicitly: serde would only emit it alongside a
    // first record, and an empty archive must still produce an appendable
    // cache file.
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(&tmp)?;
    writer.write_record(["INode", "Name", "Size", "ModTime", "Hash"])?;
    for (inode, meta) in entries {
        if meta.hash.is_empty() {
            continue;
        }
        writer.serialize(row_for(*inode, meta))?;
    }
    writer.flush().map_err(|e| io_err(&tmp, e))?;
    drop(writer);

    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Append a single record for a freshly written destination file.
pub fn append(root: &Path, inode: u64, meta: &FileMeta) -> Result<(), ArchiveError> {
    let path = cache_path(root);
    let file = OpenOptions::new()
        .append(true)
        .open(&path)
        .map_err(|e| io_err(&path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.serialize(row_for(inode, meta))?;
    writer.flush().map_err(|e| io_err(&path, e))?;
    Ok(())
}

fn row_for(inode: u64, meta: &FileMeta) -> CacheRow {
    CacheRow {
        inode,
        name: meta.path.clone(),
        size: meta.size,
        mod_time: meta.mtime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        hash: meta.hash.clone(),
    }
}

/// Stable identity of a file within its archive.
///
/// Unix has real inodes. Elsewhere std exposes no durable file index, so a
/// path fingerprint stands in; the size+mtime match predicate is the same
/// either way.
#[cfg(unix)]
pub fn file_key(md: &std::fs::Metadata, _rel_path: &str) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.ino()
}

#[cfg(not(unix))]
pub fn file_key(_md: &std::fs::Metadata, rel_path: &str) -> u64 {
    // FNV-1a over the relative path: deterministic across runs.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in rel_path.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn meta(path: &str, size: u64, hash: &str) -> FileMeta {
        FileMeta {
            path: path.to_string(),
            size,
            mtime: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 7).unwrap(),
            hash: hash.to_string(),
        }
    }

    #[test]
    fn missing_cache_loads_empty() {
        let root = TempDir::new().unwrap();
        let loaded = load(root.path()).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn store_then_load_roundtrips_hashed_entries() {
        let root = TempDir::new().unwrap();
        let entries = vec![
            (11, meta("docs/a.txt", 100, "aGFzaC1h")),
            (12, meta("b.bin", 2048, "aGFzaC1i")),
        ];
        store(root.path(), &entries).unwrap();

        let loaded = load(root.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&11], entries[0].1);
        assert_eq!(loaded[&12], entries[1].1);
    }

    #[test]
    fn unhashed_entries_are_not_persisted() {
        let root = TempDir::new().unwrap();
        let entries = vec![
            (1, meta("kept.txt", 10, "aGFzaA")),
            (2, meta("skipped.txt", 10, "")),
        ];
        store(root.path(), &entries).unwrap();

        let loaded = load(root.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&1));
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let root = TempDir::new().unwrap();
        std::fs::write(
            cache_path(root.path()),
            "INode,Name,Size,ModTime,Hash\n\
             7,good.txt,42,2024-05-01T12:00:07.000000000Z,aGFzaA\n\
             not-a-number,bad.txt,42,2024-05-01T12:00:07Z,aGFzaA\n\
             8,bad-time.txt,42,yesterday,aGFzaA\n\
             9,empty-hash.txt,42,2024-05-01T12:00:07Z,\n",
        )
        .unwrap();

        let loaded = load(root.path()).unwrap();
        assert_eq!(loaded.len(), 1, "only the fully parseable hashed row");
        assert_eq!(loaded[&7].path, "good.txt");
    }

    #[test]
    fn store_is_atomic_and_leaves_no_tmp() {
        let root = TempDir::new().unwrap();
        store(root.path(), &[(1, meta("a", 1, "aA"))]).unwrap();
        assert!(cache_path(root.path()).exists());
        assert!(!cache_path(root.path()).with_extension("csv.tmp").exists());
    }

    #[test]
    fn append_extends_an_existing_cache() {
        let root = TempDir::new().unwrap();
        store(root.path(), &[(1, meta("first.txt", 5, "aGFzaDE"))]).unwrap();
        append(root.path(), 2, &meta("second.txt", 6, "aGFzaDI")).unwrap();

        let loaded = load(root.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&2].path, "second.txt");
        assert_eq!(loaded[&2].hash, "aGFzaDI");
    }

    #[test]
    fn empty_store_still_yields_an_appendable_file() {
        let root = TempDir::new().unwrap();
        store(root.path(), &[]).unwrap();
        append(root.path(), 5, &meta("later.txt", 3, "bGF0ZXI")).unwrap();

        let loaded = load(root.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&5].path, "later.txt");
    }

    #[test]
    fn mod_time_survives_nanosecond_serialisation() {
        let root = TempDir::new().unwrap();
        let m = meta("t.txt", 9, "aGFzaA");
        store(root.path(), &[(3, m.clone())]).unwrap();
        let loaded = load(root.path()).unwrap();
        assert_eq!(loaded[&3].mtime, m.mtime);
    }
}
