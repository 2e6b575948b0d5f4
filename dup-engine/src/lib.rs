//! # dup-engine
//!
//! The orchestrator: owns the in-memory model of every archive, receives
//! worker events on a single channel, and drives the phase machine
//! `Started → Renaming → Copying → Done`. All mutation happens here, on one
//! task; archive workers only ever send events.

mod engine;

pub use engine::{run, ArchiveSummary, Phase, RunSummary};
