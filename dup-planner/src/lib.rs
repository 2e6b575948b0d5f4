//! # dup-planner
//!
//! Pure planning over scanned metadata: diff the origin against every copy
//! by content hash and produce, per copy, the renames that move existing
//! bytes into place (or into quarantine), and for the origin the copy
//! commands for content no copy can supply locally.
//!
//! Four passes, in order:
//! 1. drop files identical everywhere;
//! 2. quarantine excess replicas (hashes a copy has more of than the
//!    origin — including hashes the origin lacks entirely);
//! 3. move conflicting same-path files out of the way, prefixing their
//!    basename with the quarantine tag;
//! 4. pair remaining same-hash files into renames, and collect whatever is
//!    left over into the origin's fan-out copy list.
//!
//! The planner mutates the maps it is given so the caller's model matches
//! the post-plan world, and emits commands in deterministic lexicographic
//! order. Unhashed files (hashing failed) never match anything: copies
//! quarantine theirs, the origin re-sends its own.

use std::collections::BTreeMap;

use dup_core::{Command, FileMeta};

/// Scanned files of one archive, keyed by relative path.
pub type FileSet = BTreeMap<String, FileMeta>;

/// One copy archive's planning view.
pub struct CopyPlanInput<'a> {
    pub root: &'a str,
    pub files: &'a mut FileSet,
}

/// Plans for every archive of a run. `copies[i]` is all renames for the
/// i-th copy; `origin` is the copy fan-out list, sorted by path.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plans {
    pub origin: Vec<Command>,
    pub copies: Vec<Vec<Command>>,
}

/// Build the reconciliation plans for one run.
///
/// `backup` is the run's quarantine tag (directory name and conflict
/// prefix). Applying `copies[i]` and then the origin commands targeting
/// that copy makes its `(path, hash)` set equal the origin's, modulo the
/// quarantined leftovers.
pub fn build_plans(backup: &str, origin: &mut FileSet, copies: &mut [CopyPlanInput<'_>]) -> Plans {
    let mut copy_plans = vec![Vec::new(); copies.len()];
    ignore_identical(origin, copies);
    quarantine_excess(backup, origin, copies, &mut copy_plans);
    resolve_conflicts(backup, origin, copies, &mut copy_plans);
    let origin_plan = match_and_copy(origin, copies, &mut copy_plans);
    Plans {
        origin: origin_plan,
        copies: copy_plans,
    }
}

// ---------------------------------------------------------------------------
// Pass 1: drop files identical in origin and every copy
// ---------------------------------------------------------------------------

fn ignore_identical(origin: &mut FileSet, copies: &mut [CopyPlanInput<'_>]) {
    let identical: Vec<String> = origin
        .iter()
        .filter(|(path, original)| {
            !original.hash.is_empty()
                && copies.iter().all(|copy| {
                    copy.files
                        .get(*path)
                        .is_some_and(|f| f.size == original.size && f.hash == original.hash)
                })
        })
        .map(|(path, _)| path.clone())
        .collect();

    for path in &identical {
        origin.remove(path);
        for copy in copies.iter_mut() {
            copy.files.remove(path);
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 2: quarantine excess replicas
// ---------------------------------------------------------------------------

fn quarantine_excess(
    backup: &str,
    origin: &FileSet,
    copies: &mut [CopyPlanInput<'_>],
    plans: &mut [Vec<Command>],
) {
    let origin_buckets = by_hash(origin);
    for (i, copy) in copies.iter_mut().enumerate() {
        for (hash, paths) in by_hash(copy.files) {
            // A copy may keep as many files of a hash as the origin holds;
            // everything beyond that (and every unhashed file) moves into
            // quarantine, preserving its relative path.
            let keep = if hash.is_empty() {
                0
            } else {
                origin_buckets.get(&hash).map_or(0, Vec::len)
            };
            for path in paths.into_iter().skip(keep) {
                plans[i].push(Command::Rename {
                    source_path: path.clone(),
                    dest_path: format!("{backup}/{path}"),
                });
                copy.files.remove(&path);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 3: move conflicting same-path files out of the way
// ---------------------------------------------------------------------------

fn resolve_conflicts(
    backup: &str,
    origin: &FileSet,
    copies: &mut [CopyPlanInput<'_>],
    plans: &mut [Vec<Command>],
) {
    for path in origin.keys() {
        for (i, copy) in copies.iter_mut().enumerate() {
            let Some(mut meta) = copy.files.remove(path) else {
                continue;
            };
            let renamed = prefix_basename(path, backup);
            plans[i].push(Command::Rename {
                source_path: path.clone(),
                dest_path: renamed.clone(),
            });
            // The file stays available for hash matching under its new name.
            meta.path = renamed.clone();
            copy.files.insert(renamed, meta);
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 4: pair same-hash files into renames, copy the remainder
// ---------------------------------------------------------------------------

fn match_and_copy(
    origin: &FileSet,
    copies: &mut [CopyPlanInput<'_>],
    plans: &mut [Vec<Command>],
) -> Vec<Command> {
    let origin_buckets = by_hash(origin);
    let mut needed: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (i, copy) in copies.iter().enumerate() {
        let copy_buckets = by_hash(copy.files);
        for (hash, originals) in &origin_buckets {
            if hash.is_empty() {
                for path in originals {
                    needed.entry(path.clone()).or_default().push(copy.root.to_string());
                }
                continue;
            }
            // Conflict resolution has already moved every copy file off the
            // origin's paths, so sources and destinations zip up in plain
            // path order and no rename ever targets a live path.
            let mut sources = copy_buckets
                .get(hash)
                .cloned()
                .unwrap_or_default()
                .into_iter();
            for dest in originals {
                match sources.next() {
                    Some(source) => plans[i].push(Command::Rename {
                        source_path: source,
                        dest_path: dest.clone(),
                    }),
                    None => needed
                        .entry(dest.clone())
                        .or_default()
                        .push(copy.root.to_string()),
                }
            }
        }
    }

    needed
        .into_iter()
        .map(|(path, to_roots)| {
            let hash = origin.get(&path).map(|m| m.hash.clone()).unwrap_or_default();
            Command::Copy {
                path,
                hash,
                to_roots,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Group a file set by hash; bucket paths come out in lexicographic order.
fn by_hash(files: &FileSet) -> BTreeMap<String, Vec<String>> {
    let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (path, meta) in files {
        buckets.entry(meta.hash.clone()).or_default().push(path.clone());
    }
    buckets
}

/// `docs/a.txt` + tag → `docs/<tag>a.txt`; `a.txt` + tag → `<tag>a.txt`.
fn prefix_basename(path: &str, tag: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/{tag}{name}"),
        None => format!("{tag}{path}"),
    }
}
