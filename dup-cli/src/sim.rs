//! Canned in-memory scenario for `dup --sim`.
//!
//! Three archives exercising every planner pass: an identical file, a
//! renamed file, an excess file bound for quarantine, a conflicting file
//! replaced from the origin, and a fan-out copy.

use std::sync::Arc;

use dup_archive::MemoryArchive;
use dup_core::{Archive, Lifecycle};

pub fn archives(lifecycle: &Arc<Lifecycle>) -> Vec<Arc<dyn Archive>> {
    let origin = MemoryArchive::new("sim://origin", 0, Arc::clone(lifecycle));
    origin.insert("docs/report.txt", 2_048, "c2ltLXJlcG9ydA");
    origin.insert("photos/2024/spring.jpg", 614_400, "c2ltLXNwcmluZw");
    origin.insert("notes.txt", 512, "c2ltLW5vdGVz");
    // A cache hit: its meta arrives pre-hashed, as after a warm rescan.
    origin.mark_prehashed("photos/2024/spring.jpg");

    let copy1 = MemoryArchive::new("sim://copy-1", 1, Arc::clone(lifecycle));
    copy1.insert("docs/report-draft.txt", 2_048, "c2ltLXJlcG9ydA"); // rename into place
    copy1.insert("photos/2024/spring.jpg", 614_400, "c2ltLXNwcmluZw"); // already in place
    copy1.insert("junk/leftover.bin", 4_096, "c2ltLWp1bms"); // quarantine

    let copy2 = MemoryArchive::new("sim://copy-2", 2, Arc::clone(lifecycle));
    copy2.insert("notes.txt", 512, "c2ltLXN0YWxlLW5vdGVz"); // conflicting content

    MemoryArchive::link(&[Arc::clone(&origin), Arc::clone(&copy1), Arc::clone(&copy2)]);

    vec![
        origin as Arc<dyn Archive>,
        copy1 as Arc<dyn Archive>,
        copy2 as Arc<dyn Archive>,
    ]
}
